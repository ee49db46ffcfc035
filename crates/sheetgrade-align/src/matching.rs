use crate::features::{hamming, l2, Descriptors, Features};

/// Correspondence between a query keypoint and a reference keypoint.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FeatureMatch {
    pub query: usize,
    pub train: usize,
    pub distance: f32,
}

/// Brute-force nearest neighbour for every query descriptor.
///
/// Returns matches sorted by ascending distance. Descriptors of different
/// kinds never match.
pub fn match_features(query: &Features, train: &Features) -> Vec<FeatureMatch> {
    let mut matches: Vec<FeatureMatch> = match (&query.descriptors, &train.descriptors) {
        (Descriptors::Binary(q), Descriptors::Binary(t)) => nearest(q, t, |a, b| hamming(a, b) as f32),
        (Descriptors::Float(q), Descriptors::Float(t)) => nearest(q, t, |a, b| l2(a, b)),
        _ => Vec::new(),
    };
    matches.sort_by(|a, b| a.distance.total_cmp(&b.distance));
    matches
}

fn nearest<D, F>(query: &[D], train: &[D], dist: F) -> Vec<FeatureMatch>
where
    F: Fn(&D, &D) -> f32,
{
    if train.is_empty() {
        return Vec::new();
    }
    query
        .iter()
        .enumerate()
        .filter_map(|(qi, qd)| {
            train
                .iter()
                .enumerate()
                .map(|(ti, td)| (ti, dist(qd, td)))
                .min_by(|a, b| a.1.total_cmp(&b.1))
                .map(|(ti, d)| FeatureMatch {
                    query: qi,
                    train: ti,
                    distance: d,
                })
        })
        .collect()
}

/// Keep the best `fraction` of sorted matches, never fewer than `min_keep`
/// when that many exist.
pub fn keep_best(mut matches: Vec<FeatureMatch>, fraction: f32, min_keep: usize) -> Vec<FeatureMatch> {
    let fraction = fraction.clamp(0.0, 1.0);
    let wanted = (matches.len() as f32 * fraction).ceil() as usize;
    matches.truncate(wanted.max(min_keep).min(matches.len()));
    matches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{Descriptors, Keypoint};
    use nalgebra::Point2;

    fn binary(words: &[[u64; 4]]) -> Features {
        Features {
            keypoints: words
                .iter()
                .enumerate()
                .map(|(i, _)| Keypoint {
                    position: Point2::new(i as f32, 0.0),
                    score: 1.0,
                })
                .collect(),
            descriptors: Descriptors::Binary(words.to_vec()),
        }
    }

    #[test]
    fn nearest_neighbour_by_hamming_sorted() {
        let train = binary(&[[0, 0, 0, 0], [u64::MAX, 0, 0, 0]]);
        let query = binary(&[[u64::MAX - 1, 0, 0, 0], [0b1, 0, 0, 0]]);
        let m = match_features(&query, &train);
        assert_eq!(m.len(), 2);
        assert_eq!((m[0].query, m[0].train, m[0].distance), (0, 1, 1.0));
        assert_eq!((m[1].query, m[1].train), (1, 0));
    }

    #[test]
    fn mixed_kinds_and_empty_train_yield_nothing() {
        let float = Features {
            keypoints: vec![Keypoint {
                position: Point2::new(0.0, 0.0),
                score: 1.0,
            }],
            descriptors: Descriptors::Float(vec![vec![0.0; 4]]),
        };
        assert!(match_features(&float, &binary(&[[0; 4]])).is_empty());
        assert!(match_features(&binary(&[[0; 4]]), &binary(&[])).is_empty());
    }

    #[test]
    fn keep_best_applies_fraction_with_floor() {
        let ms: Vec<FeatureMatch> = (0..50)
            .map(|i| FeatureMatch {
                query: i,
                train: i,
                distance: i as f32,
            })
            .collect();
        assert_eq!(keep_best(ms.clone(), 0.2, 4).len(), 10);
        assert_eq!(keep_best(ms.clone(), 0.01, 4).len(), 4);
        assert_eq!(keep_best(ms[..3].to_vec(), 0.2, 4).len(), 3);
    }
}
