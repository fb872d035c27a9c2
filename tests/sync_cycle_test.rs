//! End-to-end sync cycles against an in-process mock receiver.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use md5::{Digest, Md5};
use tokio::net::{TcpListener, TcpStream};
use tsync::config::SenderConfig;
use tsync::protocol::{
    self, Check, CheckDigest, Init, InitSyncData, MessageType, Status, SyncData, SyncDeleted,
};
use tsync::sender::SyncSender;
use tsync::SyncError;

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Check { identity: String },
    StartSync,
    Init(String),
    InitSyncData(String),
    Chunk { file: String, len: usize },
    Digest { file: String, pass: bool },
    Deleted(String),
    EndSync,
}

#[derive(Default, Clone)]
struct Behavior {
    reject_check: bool,
    /// 1-based ordinals of data chunks to refuse, counted per connection.
    fail_chunks: Vec<usize>,
}

#[derive(Clone)]
struct MockReceiver {
    addr: std::net::SocketAddr,
    events: Arc<Mutex<Vec<Event>>>,
    files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MockReceiver {
    async fn start(behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let events: Arc<Mutex<Vec<Event>>> = Arc::default();
        let files: Arc<Mutex<HashMap<String, Vec<u8>>>> = Arc::default();

        {
            let events = events.clone();
            let files = files.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        break;
                    };
                    let _ = serve(stream, behavior.clone(), events.clone(), files.clone()).await;
                }
            });
        }

        Self {
            addr,
            events,
            files,
        }
    }

    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    fn file(&self, name: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(name).cloned()
    }

    fn announced(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::InitSyncData(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    /// The sender's last frames may still be in flight when `sync_all`
    /// returns; poll until the log settles.
    async fn wait_for(&self, description: &str, predicate: impl Fn(&[Event]) -> bool) {
        for _ in 0..250 {
            if predicate(&self.events()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("mock receiver never saw: {description}\nevents: {:?}", self.events());
    }
}

async fn serve(
    mut stream: TcpStream,
    behavior: Behavior,
    events: Arc<Mutex<Vec<Event>>>,
    files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
) -> tsync::Result<()> {
    let mut current_file = String::new();
    let mut digest = Md5::new();
    let mut chunk_ordinal = 0usize;

    loop {
        let (msg_type, payload) = match protocol::read_frame(&mut stream).await {
            Ok(frame) => frame,
            // Sender closed the connection; cycle is over.
            Err(_) => return Ok(()),
        };

        match msg_type {
            MessageType::Check => {
                let check = Check::decode(payload)?;
                events.lock().unwrap().push(Event::Check {
                    identity: check.identity,
                });
                let status = if behavior.reject_check {
                    Status::fail("unknown sender")
                } else {
                    Status::ok()
                };
                protocol::write_frame(&mut stream, &status.encode()).await?;
            }
            MessageType::StartSync => {
                events.lock().unwrap().push(Event::StartSync);
            }
            MessageType::Init => {
                let init = Init::decode(payload)?;
                events.lock().unwrap().push(Event::Init(init.group));
                protocol::write_frame(&mut stream, &Status::ok().encode()).await?;
            }
            MessageType::InitSyncData => {
                let msg = InitSyncData::decode(payload)?;
                current_file = msg.filename.clone();
                digest = Md5::new();
                files.lock().unwrap().insert(current_file.clone(), Vec::new());
                events.lock().unwrap().push(Event::InitSyncData(msg.filename));
            }
            MessageType::SyncData => {
                chunk_ordinal += 1;
                let chunk = SyncData::decode(payload)?;
                let status = if behavior.fail_chunks.contains(&chunk_ordinal) {
                    Status::fail("simulated chunk failure")
                } else {
                    digest.update(&chunk.data);
                    if let Some(content) = files.lock().unwrap().get_mut(&current_file) {
                        content.extend_from_slice(&chunk.data);
                    }
                    events.lock().unwrap().push(Event::Chunk {
                        file: current_file.clone(),
                        len: chunk.data.len(),
                    });
                    Status::ok()
                };
                protocol::write_frame(&mut stream, &status.encode()).await?;
            }
            MessageType::CheckDigest => {
                let msg = CheckDigest::decode(payload)?;
                let computed = hex::encode(digest.clone().finalize());
                events.lock().unwrap().push(Event::Digest {
                    file: current_file.clone(),
                    pass: computed == msg.digest,
                });
                protocol::write_frame(&mut stream, &Status::ok_with_msg(computed).encode()).await?;
            }
            MessageType::SyncDeleted => {
                let msg = SyncDeleted::decode(payload)?;
                events.lock().unwrap().push(Event::Deleted(msg.filename));
                protocol::write_frame(&mut stream, &Status::ok().encode()).await?;
            }
            MessageType::EndSync => {
                events.lock().unwrap().push(Event::EndSync);
            }
            MessageType::Status => unreachable!("sender never sends Status"),
        }
    }
}

fn test_config(root: &Path, receiver: &MockReceiver) -> SenderConfig {
    SenderConfig {
        host: "127.0.0.1".to_string(),
        port: receiver.addr.port(),
        sender_host: "127.0.0.1".to_string(),
        sender_dir: root.join("sender"),
        data_dirs: vec![root.join("data")],
        schema_log: root.join("schema.log"),
        sync_period_secs: 3600,
        heartbeat_period_secs: 10,
    }
}

fn touch(path: &Path, content: &[u8]) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

#[tokio::test]
async fn test_fresh_sender_empty_cycle() {
    let temp = tempfile::tempdir().unwrap();
    let receiver = MockReceiver::start(Behavior::default()).await;
    let config = test_config(temp.path(), &receiver);
    fs::create_dir_all(&config.data_dirs[0]).unwrap();

    let sender = SyncSender::new(config.clone());
    sender.sync_all().await.unwrap();

    receiver
        .wait_for("end of cycle", |events| events.contains(&Event::EndSync))
        .await;

    let events = receiver.events();
    let identity = fs::read_to_string(config.identity_path()).unwrap();
    assert_eq!(identity.len(), 32);
    assert_eq!(
        events,
        vec![
            Event::Check {
                identity: identity.clone()
            },
            Event::StartSync,
            Event::InitSyncData("schema.log".to_string()),
            Event::Digest {
                file: "schema.log".to_string(),
                pass: true
            },
            Event::EndSync,
        ]
    );

    // Empty baseline created, cursor at zero, journal consumed.
    assert!(tsync::baseline::load(&config.baseline_path())
        .unwrap()
        .is_empty());
    assert!(config.baseline_path().exists());
    assert_eq!(
        fs::read_to_string(config.cursor_path()).unwrap().trim(),
        "0"
    );
    assert!(!config.journal_path().exists());
    assert!(!config.snapshot_dir().exists());
}

#[tokio::test]
async fn test_single_file_with_sidecar() {
    let temp = tempfile::tempdir().unwrap();
    let receiver = MockReceiver::start(Behavior::default()).await;
    let config = test_config(temp.path(), &receiver);

    let original = config.data_dirs[0].join("g1/A.ts");
    touch(&original, b"immutable time-series blocks");
    touch(&config.data_dirs[0].join("g1/A.ts.resource"), b"index");

    let sender = SyncSender::new(config.clone());
    sender.sync_all().await.unwrap();
    receiver
        .wait_for("end of cycle", |events| events.contains(&Event::EndSync))
        .await;

    // Sidecar announced and verified before the data file.
    assert_eq!(
        receiver.announced(),
        vec!["schema.log", "A.ts.resource", "A.ts"]
    );
    let events = receiver.events();
    assert!(events.contains(&Event::Init("g1".to_string())));
    assert!(events.contains(&Event::Digest {
        file: "A.ts.resource".to_string(),
        pass: true
    }));
    assert!(events.contains(&Event::Digest {
        file: "A.ts".to_string(),
        pass: true
    }));
    assert_eq!(
        receiver.file("A.ts").unwrap(),
        b"immutable time-series blocks"
    );

    // Baseline records the original path; the snapshot directory is gone.
    let baseline = tsync::baseline::load(&config.baseline_path()).unwrap();
    assert!(baseline.contains(&original));
    assert!(!config.snapshot_dir().exists());
}

#[tokio::test]
async fn test_deletions_precede_additions() {
    let temp = tempfile::tempdir().unwrap();
    let receiver = MockReceiver::start(Behavior::default()).await;
    let config = test_config(temp.path(), &receiver);

    let old = config.data_dirs[0].join("g1/old.ts");
    let new = config.data_dirs[0].join("g1/new.ts");
    touch(&new, b"fresh blocks");
    touch(&config.data_dirs[0].join("g1/new.ts.resource"), b"index");

    // The baseline claims old.ts was shipped before; it is gone from disk.
    let baseline = std::collections::BTreeSet::from([old.clone()]);
    tsync::baseline::promote(&config.baseline_path(), &baseline).unwrap();

    let sender = SyncSender::new(config.clone());
    sender.sync_all().await.unwrap();
    receiver
        .wait_for("end of cycle", |events| events.contains(&Event::EndSync))
        .await;

    let events = receiver.events();
    let deleted_at = events
        .iter()
        .position(|e| *e == Event::Deleted("old.ts".to_string()))
        .expect("deletion shipped");
    let addition_at = events
        .iter()
        .position(|e| *e == Event::InitSyncData("new.ts.resource".to_string()))
        .expect("addition shipped");
    assert!(deleted_at < addition_at);

    let after = tsync::baseline::load(&config.baseline_path()).unwrap();
    assert!(!after.contains(&old));
    assert!(after.contains(&new));
}

#[tokio::test]
async fn test_persistent_chunk_rejection_aborts_then_next_cycle_recovers() {
    let temp = tempfile::tempdir().unwrap();
    // Schema log is absent, so the sidecar takes ordinal 1 and each of the
    // data file's five attempts one more.
    let receiver = MockReceiver::start(Behavior {
        fail_chunks: vec![2, 3, 4, 5, 6],
        ..Behavior::default()
    })
    .await;
    let config = test_config(temp.path(), &receiver);

    let original = config.data_dirs[0].join("g1/a.ts");
    touch(&original, b"blocks");
    touch(&config.data_dirs[0].join("g1/a.ts.resource"), b"index");

    let sender = SyncSender::new(config.clone());
    let err = sender.sync_all().await.unwrap_err();
    assert!(matches!(err, SyncError::Connection(_)));

    // Aborted cycle: no baseline promotion, journal left for recovery.
    assert!(!config.baseline_path().exists());
    assert!(config.journal_path().exists());

    // A healthy receiver on the next cycle picks the file back up.
    let receiver = MockReceiver::start(Behavior::default()).await;
    let config = test_config(temp.path(), &receiver);
    let sender = SyncSender::new(config.clone());
    sender.sync_all().await.unwrap();
    receiver
        .wait_for("end of cycle", |events| events.contains(&Event::EndSync))
        .await;

    let baseline = tsync::baseline::load(&config.baseline_path()).unwrap();
    assert!(baseline.contains(&original));
    assert!(!config.journal_path().exists());
}

#[tokio::test]
async fn test_recovery_keeps_journaled_file_without_reshipping() {
    let temp = tempfile::tempdir().unwrap();
    let receiver = MockReceiver::start(Behavior::default()).await;
    let config = test_config(temp.path(), &receiver);

    let original = config.data_dirs[0].join("g1/a.ts");
    touch(&original, b"blocks");
    touch(&config.data_dirs[0].join("g1/a.ts.resource"), b"index");

    // Simulate a crash after SENT was journaled but before the baseline
    // swap: the journal exists, the baseline does not.
    fs::create_dir_all(&config.sender_dir).unwrap();
    fs::write(
        config.journal_path(),
        format!("BEGIN_TSFILES\nSENT {}\n", original.display()),
    )
    .unwrap();

    let sender = SyncSender::new(config.clone());
    sender.sync_all().await.unwrap();
    receiver
        .wait_for("end of cycle", |events| events.contains(&Event::EndSync))
        .await;

    // The acknowledged file lands in the baseline without a second ship.
    assert_eq!(receiver.announced(), vec!["schema.log"]);
    let baseline = tsync::baseline::load(&config.baseline_path()).unwrap();
    assert!(baseline.contains(&original));
}

#[tokio::test]
async fn test_receiver_rejection_aborts_cycle() {
    let temp = tempfile::tempdir().unwrap();
    let receiver = MockReceiver::start(Behavior {
        reject_check: true,
        ..Behavior::default()
    })
    .await;
    let config = test_config(temp.path(), &receiver);
    fs::create_dir_all(&config.data_dirs[0]).unwrap();

    let sender = SyncSender::new(config.clone());
    let err = sender.sync_all().await.unwrap_err();
    assert!(matches!(err, SyncError::Rejected(_)));

    let events = receiver.events();
    assert!(!events.contains(&Event::StartSync));
    assert!(!config.baseline_path().exists());
}

#[tokio::test]
async fn test_second_cycle_ships_only_new_files() {
    let temp = tempfile::tempdir().unwrap();
    let receiver = MockReceiver::start(Behavior::default()).await;
    let config = test_config(temp.path(), &receiver);

    let first = config.data_dirs[0].join("g1/a.ts");
    touch(&first, b"first");
    touch(&config.data_dirs[0].join("g1/a.ts.resource"), b"ra");

    let sender = SyncSender::new(config.clone());
    sender.sync_all().await.unwrap();
    receiver
        .wait_for("first cycle end", |events| {
            events.iter().filter(|e| **e == Event::EndSync).count() == 1
        })
        .await;

    let second = config.data_dirs[0].join("g1/b.ts");
    touch(&second, b"second");
    touch(&config.data_dirs[0].join("g1/b.ts.resource"), b"rb");

    sender.sync_all().await.unwrap();
    receiver
        .wait_for("second cycle end", |events| {
            events.iter().filter(|e| **e == Event::EndSync).count() == 2
        })
        .await;

    let announced = receiver.announced();
    assert_eq!(
        announced.iter().filter(|name| *name == "a.ts").count(),
        1,
        "unchanged file must not be re-shipped"
    );
    assert_eq!(announced.iter().filter(|name| *name == "b.ts").count(), 1);

    let baseline = tsync::baseline::load(&config.baseline_path()).unwrap();
    assert!(baseline.contains(&first));
    assert!(baseline.contains(&second));
}
