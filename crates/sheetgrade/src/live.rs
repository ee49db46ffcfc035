//! Live grading sessions.
//!
//! A client streams camera frames as JSON messages; each session grades at
//! most one frame at a time on its own worker thread. When frames arrive
//! faster than they can be graded only the newest one waits, older queued
//! frames are dropped. Progress and results flow back as [`StatusEvent`]s on
//! the channel returned by [`LiveSession::start`].

use std::collections::HashMap;
use std::fmt;
use std::io::Cursor;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use dashmap::DashMap;
use image::{ImageFormat, RgbImage};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SheetError;
use crate::events::{Status, StatusEvent};
use crate::pipeline::{complete_event, ExamContext, GradingPipeline};

/// Exam identifier as sent by clients: a number or a string.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExamId {
    Number(i64),
    Text(String),
}

impl fmt::Display for ExamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s.trim()),
        }
    }
}

/// Client to server message.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    CaptureFrame { frame: String, exam_id: ExamId },
    EndSession,
}

/// Looks up answer keys and rosters by exam id.
pub trait ExamDirectory: Send + Sync {
    fn resolve(&self, exam_id: &str) -> Option<ExamContext>;
}

/// In-memory [`ExamDirectory`].
#[derive(Debug, Default)]
pub struct StaticExams {
    exams: HashMap<String, ExamContext>,
}

impl StaticExams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, exam_id: impl Into<String>, exam: ExamContext) {
        self.exams.insert(exam_id.into(), exam);
    }
}

impl ExamDirectory for StaticExams {
    fn resolve(&self, exam_id: &str) -> Option<ExamContext> {
        self.exams.get(exam_id).cloned()
    }
}

/// Decode a `data:` URL or a bare base64 payload.
pub fn decode_frame(frame: &str) -> Result<Vec<u8>, SheetError> {
    let payload = match frame.find("base64,") {
        Some(i) => &frame[i + "base64,".len()..],
        None => frame,
    };
    let bytes = STANDARD
        .decode(payload.trim())
        .map_err(|e| SheetError::Frame(e.to_string()))?;
    if bytes.is_empty() {
        return Err(SheetError::Frame("empty frame".into()));
    }
    Ok(bytes)
}

/// PNG data URL of `img`.
pub fn encode_png_data_url(img: &RgbImage) -> Result<String, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;
    Ok(format!("data:image/png;base64,{}", STANDARD.encode(&buf)))
}

/// Whether the session accepts more messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Closed,
}

struct Job {
    bytes: Vec<u8>,
    exam_id: String,
    exam: ExamContext,
}

#[derive(Default)]
struct Slot {
    pending: Option<Job>,
    closed: bool,
}

type Shared = Arc<(Mutex<Slot>, Condvar)>;

fn next_job(shared: &Shared) -> Option<Job> {
    let (lock, ready) = &**shared;
    let mut slot = lock.lock().unwrap_or_else(PoisonError::into_inner);
    loop {
        if let Some(job) = slot.pending.take() {
            return Some(job);
        }
        if slot.closed {
            return None;
        }
        slot = ready.wait(slot).unwrap_or_else(PoisonError::into_inner);
    }
}

fn grade_frame(pipeline: &GradingPipeline, job: Job, frame_no: usize, events: &Sender<StatusEvent>) {
    let mut sink = |ev: StatusEvent| {
        // a client that went away just stops listening
        let _ = events.send(ev);
    };
    let img = match image::load_from_memory(&job.bytes) {
        Ok(img) => img,
        Err(e) => {
            sink(StatusEvent::new(Status::Error, format!("failed to decode frame: {e}")));
            return;
        }
    };
    let name = format!("exam-{}-frame-{frame_no}", job.exam_id);
    let Ok(sheet) = pipeline.grade(&img, &name, &job.exam, &mut sink) else {
        // failure already reported by the pipeline
        return;
    };

    let mut ev = complete_event(&sheet);
    match encode_png_data_url(&sheet.annotated) {
        Ok(url) => {
            if let Value::Object(map) = &mut ev.details {
                map.insert("annotated_image".into(), Value::String(url));
            }
        }
        Err(e) => warn!("{name}: failed to encode annotated image: {e}"),
    }
    sink(ev);
}

fn run_worker(shared: Shared, pipeline: Arc<GradingPipeline>, events: Sender<StatusEvent>) {
    let mut frame_no = 0;
    while let Some(job) = next_job(&shared) {
        frame_no += 1;
        grade_frame(&pipeline, job, frame_no, &events);
    }
}

/// One client connection.
pub struct LiveSession {
    id: String,
    shared: Shared,
    events: Sender<StatusEvent>,
    exams: Arc<dyn ExamDirectory>,
    worker: Option<JoinHandle<()>>,
}

impl LiveSession {
    /// Spawn the session worker. Events arrive on the returned receiver.
    pub fn start(
        id: impl Into<String>,
        pipeline: Arc<GradingPipeline>,
        exams: Arc<dyn ExamDirectory>,
    ) -> (Self, Receiver<StatusEvent>) {
        let id = id.into();
        let (tx, rx) = mpsc::channel();
        let shared: Shared = Arc::new((Mutex::new(Slot::default()), Condvar::new()));

        let worker = {
            let shared = Arc::clone(&shared);
            let events = tx.clone();
            thread::Builder::new()
                .name(format!("live-{id}"))
                .spawn(move || run_worker(shared, pipeline, events))
        };
        let worker = match worker {
            Ok(handle) => Some(handle),
            Err(e) => {
                let _ = tx.send(StatusEvent::new(
                    Status::Error,
                    format!("failed to start session worker: {e}"),
                ));
                None
            }
        };
        debug!("live session {id} started");

        let session = Self {
            id,
            shared,
            events: tx,
            exams,
            worker,
        };
        (session, rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        let (lock, _) = &*self.shared;
        lock.lock().unwrap_or_else(PoisonError::into_inner).closed
    }

    fn emit(&self, event: StatusEvent) {
        let _ = self.events.send(event);
    }

    /// Parse and act on one raw client message. `end_session` waits for the
    /// worker to finish the frames it already holds.
    pub fn handle_message(&mut self, raw: &str) -> SessionState {
        let state = self.dispatch(raw);
        if state == SessionState::Closed {
            self.end();
        }
        state
    }

    /// Like [`LiveSession::handle_message`] but never waits: `end_session`
    /// only stops intake, and the worker is joined on [`LiveSession::end`] or
    /// drop.
    pub fn dispatch(&self, raw: &str) -> SessionState {
        let message = match serde_json::from_str::<Inbound>(raw) {
            Ok(m) => m,
            Err(e) => {
                self.emit(StatusEvent::new(Status::Error, format!("invalid message: {e}")));
                return self.state();
            }
        };
        match message {
            Inbound::CaptureFrame { frame, exam_id } => {
                self.capture(&frame, &exam_id.to_string());
                self.state()
            }
            Inbound::EndSession => {
                self.request_end();
                SessionState::Closed
            }
        }
    }

    fn state(&self) -> SessionState {
        if self.is_closed() {
            SessionState::Closed
        } else {
            SessionState::Open
        }
    }

    fn capture(&self, frame: &str, exam_id: &str) {
        let Some(exam) = self.exams.resolve(exam_id) else {
            self.emit(StatusEvent::new(Status::Error, format!("unknown exam {exam_id}")));
            return;
        };
        let bytes = match decode_frame(frame) {
            Ok(b) => b,
            Err(e) => {
                self.emit(StatusEvent::new(Status::Error, e.to_string()));
                return;
            }
        };
        self.submit(Job {
            bytes,
            exam_id: exam_id.to_string(),
            exam,
        });
    }

    fn submit(&self, job: Job) {
        let (lock, ready) = &*self.shared;
        let mut slot = lock.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.closed {
            drop(slot);
            self.emit(StatusEvent::new(Status::Error, "session has ended"));
            return;
        }
        let replaced = slot.pending.replace(job).is_some();
        ready.notify_one();
        drop(slot);
        if replaced {
            self.emit(StatusEvent::new(
                Status::Warning,
                "frame dropped, a newer frame replaced it",
            ));
        }
    }

    /// Stop accepting frames without waiting for the worker.
    pub fn request_end(&self) {
        let (lock, ready) = &*self.shared;
        let mut slot = lock.lock().unwrap_or_else(PoisonError::into_inner);
        slot.closed = true;
        ready.notify_all();
    }

    /// Stop accepting frames, let the queued and in-flight frames finish and
    /// wait for the worker. Calling it again does nothing.
    pub fn end(&mut self) {
        self.request_end();
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!("live session {} worker panicked", self.id);
            }
            debug!("live session {} ended", self.id);
        }
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        self.end();
    }
}

/// Concurrent map of open sessions sharing one pipeline.
pub struct SessionRegistry {
    sessions: DashMap<String, LiveSession>,
    pipeline: Arc<GradingPipeline>,
    exams: Arc<dyn ExamDirectory>,
}

impl SessionRegistry {
    pub fn new(pipeline: Arc<GradingPipeline>, exams: Arc<dyn ExamDirectory>) -> Self {
        Self {
            sessions: DashMap::new(),
            pipeline,
            exams,
        }
    }

    /// Open session `id`, ending any previous session with that id.
    pub fn open(&self, id: &str) -> Receiver<StatusEvent> {
        let (session, rx) = LiveSession::start(id, Arc::clone(&self.pipeline), Arc::clone(&self.exams));
        if let Some(old) = self.sessions.insert(id.to_string(), session) {
            warn!("live session {id} reopened; previous one ended");
            drop(old);
        }
        rx
    }

    /// Route a message to session `id`; `None` when no such session is open.
    ///
    /// A session that closes is removed from the map first and then waits for
    /// its worker, so the map stays usable while the last frames finish.
    pub fn handle(&self, id: &str, raw: &str) -> Option<SessionState> {
        let state = self.sessions.get(id)?.dispatch(raw);
        if state == SessionState::Closed {
            if let Some((_, mut session)) = self.sessions.remove(id) {
                session.end();
            }
        }
        Some(state)
    }

    /// End and remove session `id`.
    pub fn close(&self, id: &str) -> bool {
        match self.sessions.remove(id) {
            Some((_, mut session)) => {
                session.end();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
