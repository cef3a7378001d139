use replicore::{
    AppContext, Commit, CommitKind, Engine, EngineBuilder, Entry, EntryPayload,
    InMemoryEngineMetrics, Log, RecordingEventSink, Session, SessionListener, SnapshotReader,
    SnapshotStore, SnapshotWriter, StateMachine,
};
use std::cell::{Cell, RefCell};
use std::error::Error;
use std::rc::Rc;

/// State machine used across the scenario tests.
///
/// Commands echo `<payload>-ok`; a payload of `fail` raises a
/// deterministic error; a payload of `publish:<event>` additionally
/// publishes the event to the issuing session. Queries report the
/// payload and the index they ran at. Snapshot support serializes the
/// applied history and can be toggled mid-test through a shared flag.
pub struct TestMachine {
    pub applied: Vec<(u64, String)>,
    snapshottable: Rc<Cell<bool>>,
}

impl TestMachine {
    pub fn new() -> (Self, Rc<Cell<bool>>) {
        let snapshottable = Rc::new(Cell::new(false));
        (
            Self {
                applied: Vec::new(),
                snapshottable: snapshottable.clone(),
            },
            snapshottable,
        )
    }
}

impl StateMachine for TestMachine {
    fn init(&mut self, _context: &mut AppContext) {}

    fn apply(&mut self, mut commit: Commit<'_>) -> Result<Vec<u8>, Box<dyn Error>> {
        let text = String::from_utf8_lossy(commit.payload()).into_owned();
        match commit.kind() {
            CommitKind::Command => {
                if text == "fail" {
                    return Err("deterministic failure".into());
                }
                if let Some(event) = text.strip_prefix("publish:") {
                    let event = event.as_bytes().to_vec();
                    commit.publish(event);
                }
                self.applied.push((commit.index(), text.clone()));
                Ok(format!("{text}-ok").into_bytes())
            }
            CommitKind::Query => Ok(format!("{text}@{}", commit.index()).into_bytes()),
        }
    }

    fn is_snapshottable(&self) -> bool {
        self.snapshottable.get()
    }

    fn snapshot(&self, writer: &mut SnapshotWriter<'_>) {
        writer
            .write_json(&self.applied)
            .expect("snapshot serialization");
    }

    fn install(&mut self, reader: SnapshotReader<'_>) {
        self.applied = reader.read_json().expect("snapshot deserialization");
    }
}

/// Listener recording lifecycle callbacks in invocation order.
pub struct RecordingListener {
    calls: Rc<RefCell<Vec<String>>>,
}

impl RecordingListener {
    pub fn new() -> (Self, Rc<RefCell<Vec<String>>>) {
        let calls = Rc::new(RefCell::new(Vec::new()));
        (
            Self {
                calls: calls.clone(),
            },
            calls,
        )
    }
}

impl SessionListener for RecordingListener {
    fn register(&mut self, session: &Session) {
        self.calls.borrow_mut().push(format!("register:{}", session.id()));
    }

    fn unregister(&mut self, session: &Session) {
        self.calls
            .borrow_mut()
            .push(format!("unregister:{}", session.id()));
    }

    fn expire(&mut self, session: &Session) {
        self.calls.borrow_mut().push(format!("expire:{}", session.id()));
    }

    fn close(&mut self, session: &Session) {
        self.calls.borrow_mut().push(format!("close:{}", session.id()));
    }
}

pub struct Harness {
    pub engine: Engine<TestMachine>,
    pub sink: RecordingEventSink,
    pub metrics: InMemoryEngineMetrics,
    pub listener_calls: Rc<RefCell<Vec<String>>>,
    pub snapshottable: Rc<Cell<bool>>,
}

pub fn harness() -> Harness {
    let (machine, snapshottable) = TestMachine::new();
    let (listener, listener_calls) = RecordingListener::new();
    let sink = RecordingEventSink::new();
    let metrics = InMemoryEngineMetrics::default();
    let engine = EngineBuilder::new()
        .listener(Box::new(listener))
        .sink(Box::new(sink.clone()))
        .metrics(Box::new(metrics.clone()))
        .build(machine, Log::new(), SnapshotStore::new())
        .expect("engine build");
    Harness {
        engine,
        sink,
        metrics,
        listener_calls,
        snapshottable,
    }
}

pub fn register(index: u64, client_id: &str, timeout_ms: u64, timestamp_ms: u64) -> Entry {
    Entry {
        term: 1,
        index,
        timestamp_ms,
        payload: EntryPayload::Register {
            client_id: client_id.to_string(),
            timeout_ms,
        },
    }
}

pub fn command(index: u64, session: u64, sequence: u64, payload: &str, timestamp_ms: u64) -> Entry {
    Entry {
        term: 1,
        index,
        timestamp_ms,
        payload: EntryPayload::Command {
            session,
            sequence,
            payload: payload.as_bytes().to_vec(),
        },
    }
}

pub fn keep_alive(
    index: u64,
    session: u64,
    command_sequence: u64,
    event_index: u64,
    timestamp_ms: u64,
) -> Entry {
    Entry {
        term: 1,
        index,
        timestamp_ms,
        payload: EntryPayload::KeepAlive {
            session,
            command_sequence,
            event_index,
        },
    }
}

pub fn unregister(index: u64, session: u64, expired: bool, timestamp_ms: u64) -> Entry {
    Entry {
        term: 1,
        index,
        timestamp_ms,
        payload: EntryPayload::Unregister { session, expired },
    }
}

pub fn initialize(index: u64, timestamp_ms: u64) -> Entry {
    Entry {
        term: 1,
        index,
        timestamp_ms,
        payload: EntryPayload::Initialize,
    }
}

pub fn connect(index: u64, client_id: &str, timestamp_ms: u64) -> Entry {
    Entry {
        term: 1,
        index,
        timestamp_ms,
        payload: EntryPayload::Connect {
            client_id: client_id.to_string(),
        },
    }
}
