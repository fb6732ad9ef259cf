//! Integration tests for the TCP store connection
//!
//! A scripted store runs in-process on an ephemeral port and answers the
//! line protocol with canned replies:
//! - `validate` rejects the query `bad`
//! - `fetch` answers three entries between metadata `c3` and `c1`; the
//!   query `slow` never gets an answer, `garbled` breaks off with a line
//!   that is not a reply, and `partial` reports an error after one entry
//! - `single` knows every id except `404`
//! - `query` acknowledges and then pushes one entry and one metadata line;
//!   the query `binary` first pushes a payload that is not UTF-8
//! - `insertionFilter` rejects the filter `reject`

use bytes::Bytes;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use trawl::classify::CapabilityRegistry;
use trawl::config::StoreConfig;
use trawl::entry::{Entry, Metadata};
use trawl::store::bootstrap::{configure, wait_for_store};
use trawl::store::protocol::{Command, Reply};
use trawl::store::{
    Direction, FetchRequest, LiveFeeds, Mode, StoreConnection, StoreError, TcpDialer,
    TcpStoreConnection,
};
use trawl::stream::{StreamController, StreamError, StreamParams, SubscriberId};
use trawl::testing::{Delivery, RecordingTransport, metadata_bytes, sample_entry_bytes};

// =============================================================================
// Scripted store
// =============================================================================

struct ScriptedStore {
    port: u16,
    /// Every line received, across all connections
    received: Arc<Mutex<Vec<String>>>,
}

impl ScriptedStore {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let received = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&received);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_connection(stream, Arc::clone(&log)));
            }
        });

        Self { port, received }
    }

    fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }

    async fn connect(&self) -> TcpStoreConnection {
        TcpStoreConnection::connect("127.0.0.1", self.port)
            .await
            .unwrap()
    }
}

fn data(payload: &[u8]) -> Vec<u8> {
    Reply::Data(Bytes::copy_from_slice(payload)).encode()
}

fn meta(payload: &[u8]) -> Vec<u8> {
    Reply::Meta(Bytes::copy_from_slice(payload)).encode()
}

async fn serve_connection(stream: tokio::net::TcpStream, log: Arc<Mutex<Vec<String>>>) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let mut inserting = false;

    while let Ok(Some(text)) = lines.next_line().await {
        log.lock().unwrap().push(text.clone());
        if inserting {
            continue;
        }

        let Ok(command) = serde_json::from_str::<Command>(&text) else {
            let _ = writer.write_all(b"err malformed command\n").await;
            continue;
        };

        let reply: Vec<u8> = match command {
            Command::Mode { mode } => {
                inserting = mode == Mode::Insert;
                b"ok\n".to_vec()
            }
            Command::Validate { query } if query == "bad" => b"err unexpected token\n".to_vec(),
            Command::Validate { .. } => b"ok\n".to_vec(),
            Command::Fetch { query, .. } if query == "slow" => continue,
            Command::Fetch { query, .. } if query == "garbled" => {
                [meta(&metadata_bytes("c3")), b"bogus line\n".to_vec()].concat()
            }
            Command::Fetch { query, .. } if query == "partial" => [
                meta(&metadata_bytes("c3")),
                data(&sample_entry_bytes("3")),
                b"err index corrupt\n".to_vec(),
            ]
            .concat(),
            Command::Fetch { .. } => [
                meta(&metadata_bytes("c3")),
                data(&sample_entry_bytes("3")),
                data(&sample_entry_bytes("2")),
                data(&sample_entry_bytes("1")),
                meta(&metadata_bytes("c1")),
                b"end\n".to_vec(),
            ]
            .concat(),
            Command::Single { id, .. } if id == "404" => b"err not found\n".to_vec(),
            Command::Single { id, .. } => data(&sample_entry_bytes(&id)),
            Command::Query { query, .. } => {
                let mut reply = b"ok\n".to_vec();
                if query == "binary" {
                    reply.extend_from_slice(b"data \xff\xfe\n");
                }
                reply.extend(data(&sample_entry_bytes("9")));
                reply.extend(meta(&metadata_bytes("c9")));
                reply
            }
            Command::InsertionFilter { filter } if filter == "reject" => {
                b"err filter does not parse\n".to_vec()
            }
            Command::Macro { .. } | Command::Limit { .. } | Command::InsertionFilter { .. } => {
                b"ok\n".to_vec()
            }
        };

        if writer.write_all(&reply).await.is_err() {
            break;
        }
    }
}

async fn recv(rx: &mut mpsc::Receiver<Bytes>) -> Bytes {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap()
}

fn fetch_request(query: &str) -> FetchRequest {
    FetchRequest {
        left_off: "latest".to_string(),
        direction: Direction::Backward,
        query: query.to_string(),
        limit: 3,
    }
}

// =============================================================================
// Query mode
// =============================================================================

mod query_tests {
    use super::*;

    #[tokio::test]
    async fn test_fetch_collects_batch_between_metadata() {
        let store = ScriptedStore::start().await;
        let mut connection = store.connect().await;

        connection.set_mode(Mode::Query).await.unwrap();
        let batch = connection
            .fetch(&fetch_request("http"), Duration::from_secs(2))
            .await
            .unwrap();

        let ids: Vec<String> = batch
            .entries
            .iter()
            .map(|raw| serde_json::from_slice::<Entry>(raw).unwrap().id)
            .collect();
        assert_eq!(ids, vec!["3", "2", "1"]);

        let first: Metadata = serde_json::from_slice(&batch.first_meta).unwrap();
        let last: Metadata = serde_json::from_slice(&batch.last_meta).unwrap();
        assert_eq!(first.left_off, "c3");
        assert_eq!(last.left_off, "c1");

        connection.close().await;

        let received = store.received();
        assert!(received[1].contains(r#""cmd":"fetch""#));
        assert!(received[1].contains(r#""direction":-1"#));
    }

    #[tokio::test]
    async fn test_validate_reports_store_message() {
        let store = ScriptedStore::start().await;
        let mut connection = store.connect().await;
        connection.set_mode(Mode::Query).await.unwrap();

        connection.validate("http").await.unwrap();
        let err = connection.validate("bad").await.unwrap_err();
        assert!(matches!(err, StoreError::Validation(ref m) if m == "unexpected token"));
        assert_eq!(err.to_string(), "unexpected token");

        // a rejected query leaves the link usable
        connection.validate("http").await.unwrap();
    }

    #[tokio::test]
    async fn test_commands_require_negotiated_mode() {
        let store = ScriptedStore::start().await;
        let mut connection = store.connect().await;

        let err = connection
            .fetch(&fetch_request("http"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::State(_)));

        connection.set_mode(Mode::Insert).await.unwrap();
        assert!(matches!(
            connection.validate("http").await,
            Err(StoreError::State(_))
        ));
    }

    #[tokio::test]
    async fn test_single_found_and_missing() {
        let store = ScriptedStore::start().await;
        let mut connection = store.connect().await;
        connection.set_mode(Mode::Query).await.unwrap();

        let raw = connection.single("17", "").await.unwrap();
        let entry: Entry = serde_json::from_slice(&raw).unwrap();
        assert_eq!(entry.id, "17");

        let err = connection.single("404", "").await.unwrap_err();
        assert!(matches!(err, StoreError::Rejected(ref m) if m == "not found"));
    }

    #[tokio::test]
    async fn test_fetch_timeout_poisons_connection() {
        let store = ScriptedStore::start().await;
        let mut connection = store.connect().await;
        connection.set_mode(Mode::Query).await.unwrap();

        let err = connection
            .fetch(&fetch_request("slow"), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Timeout(_)));

        assert!(matches!(
            connection.validate("http").await,
            Err(StoreError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_garbled_fetch_reply_poisons_connection() {
        let store = ScriptedStore::start().await;
        let mut connection = store.connect().await;
        connection.set_mode(Mode::Query).await.unwrap();

        let err = connection
            .fetch(&fetch_request("garbled"), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Protocol(_)));
        assert!(matches!(
            connection.validate("http").await,
            Err(StoreError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_store_error_mid_fetch_keeps_link_usable() {
        let store = ScriptedStore::start().await;
        let mut connection = store.connect().await;
        connection.set_mode(Mode::Query).await.unwrap();

        let err = connection
            .fetch(&fetch_request("partial"), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Fetch(ref m) if m == "index corrupt"));

        connection.validate("http").await.unwrap();
    }
}

// =============================================================================
// Live queries
// =============================================================================

mod live_tests {
    use super::*;

    #[tokio::test]
    async fn test_live_query_routes_data_and_metadata() {
        let store = ScriptedStore::start().await;
        let mut connection = store.connect().await;
        connection.set_mode(Mode::Query).await.unwrap();

        let (data_tx, mut data_rx) = mpsc::channel(8);
        let (meta_tx, mut meta_rx) = mpsc::channel(8);
        connection
            .live_query(
                "c3",
                "http",
                LiveFeeds {
                    data: data_tx,
                    meta: meta_tx,
                },
            )
            .await
            .unwrap();

        let raw = tokio::time::timeout(Duration::from_secs(2), data_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(serde_json::from_slice::<Entry>(&raw).unwrap().id, "9");

        let raw = tokio::time::timeout(Duration::from_secs(2), meta_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            serde_json::from_slice::<Metadata>(&raw).unwrap().left_off,
            "c9"
        );

        // the link belongs to the live reader now
        assert!(matches!(
            connection.validate("http").await,
            Err(StoreError::State(_))
        ));

        tokio::time::timeout(Duration::from_secs(2), connection.close())
            .await
            .unwrap();
        assert!(data_rx.recv().await.is_none());
        assert!(meta_rx.recv().await.is_none());

        assert!(store.received()[1].contains(r#""leftOff":"c3""#));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let store = ScriptedStore::start().await;
        let mut connection = store.connect().await;
        connection.set_mode(Mode::Query).await.unwrap();

        connection.close().await;
        connection.close().await;
        assert!(matches!(
            connection.set_mode(Mode::Query).await,
            Err(StoreError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_non_utf8_live_payload_reaches_feed_as_bytes() {
        let store = ScriptedStore::start().await;
        let mut connection = store.connect().await;
        connection.set_mode(Mode::Query).await.unwrap();

        let (data_tx, mut data_rx) = mpsc::channel(8);
        let (meta_tx, mut meta_rx) = mpsc::channel(8);
        connection
            .live_query(
                "c3",
                "binary",
                LiveFeeds {
                    data: data_tx,
                    meta: meta_tx,
                },
            )
            .await
            .unwrap();

        assert_eq!(recv(&mut data_rx).await, Bytes::from_static(b"\xff\xfe"));
        let raw = recv(&mut data_rx).await;
        assert_eq!(serde_json::from_slice::<Entry>(&raw).unwrap().id, "9");
        let raw = recv(&mut meta_rx).await;
        assert_eq!(
            serde_json::from_slice::<Metadata>(&raw).unwrap().left_off,
            "c9"
        );

        connection.close().await;
    }
}

// =============================================================================
// Insert mode and startup
// =============================================================================

mod insert_tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_writes_one_line_per_entry() {
        let store = ScriptedStore::start().await;
        let mut connection = store.connect().await;
        connection.set_mode(Mode::Insert).await.unwrap();

        connection.insert(br#"{"id":"a"}"#).await.unwrap();
        connection.insert(br#"{"id":"b"}"#).await.unwrap();
        connection.close().await;

        let mut received = Vec::new();
        for _ in 0..50 {
            received = store.received();
            if received.len() >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(&received[1..], &[r#"{"id":"a"}"#, r#"{"id":"b"}"#]);
    }

    #[tokio::test]
    async fn test_configure_registers_limit_and_macros() {
        let store = ScriptedStore::start().await;
        let dialer = TcpDialer::new("127.0.0.1", store.port);
        let registry = CapabilityRegistry::with_defaults();
        let config = StoreConfig {
            port: store.port,
            insertion_filter: "reject".to_string(),
            ..StoreConfig::default()
        };

        // a rejected insertion filter does not fail startup
        configure(&dialer, &registry, &config).await.unwrap();

        let received = store.received();
        assert!(received.iter().any(|l| l.contains(r#""cmd":"limit""#)));
        let macros = received
            .iter()
            .filter(|l| l.contains(r#""cmd":"macro""#))
            .count();
        assert_eq!(macros, registry.macros().len());
        assert!(received.last().unwrap().contains("insertionFilter"));
    }

    #[tokio::test]
    async fn test_wait_for_store_gives_up_after_deadline() {
        let store = ScriptedStore::start().await;
        wait_for_store(
            &format!("127.0.0.1:{}", store.port),
            Duration::from_millis(10),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        let closed_port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let err = wait_for_store(
            &format!("127.0.0.1:{closed_port}"),
            Duration::from_millis(10),
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, StoreError::Connect { .. }));
    }
}

// =============================================================================
// Streams over TCP
// =============================================================================

mod stream_tests {
    use super::*;

    type Running = (
        Arc<RecordingTransport>,
        watch::Sender<bool>,
        JoinHandle<Result<(), StreamError>>,
    );

    fn run_stream(store: &ScriptedStore, params: StreamParams) -> Running {
        let transport = Arc::new(RecordingTransport::new());
        let controller = StreamController::new(
            SubscriberId(1),
            Arc::new(TcpDialer::new("127.0.0.1", store.port)),
            transport.clone(),
            16,
        );
        let (cancel_tx, cancel) = watch::channel(false);
        let task = tokio::spawn(controller.run(params, cancel));
        (transport, cancel_tx, task)
    }

    #[tokio::test]
    async fn test_garbled_fetch_goes_live_from_client_cursor() {
        let store = ScriptedStore::start().await;
        let params = StreamParams {
            left_off: "C".to_string(),
            fetch: 3,
            query: "garbled".to_string(),
            ..StreamParams::default()
        };
        let (transport, cancel_tx, task) = run_stream(&store, params);

        transport.wait_for_len(2).await;
        assert_eq!(transport.entry_ids(), vec!["9"]);
        assert_eq!(transport.metadata_cursors(), vec!["c9"]);
        assert!(!transport.deliveries().contains(&Delivery::Cleanup));

        let live = store
            .received()
            .into_iter()
            .find(|l| l.contains(r#""cmd":"query""#))
            .expect("no live query sent");
        assert!(live.contains(r#""leftOff":"C""#));

        cancel_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_undecodable_live_item_is_skipped() {
        let store = ScriptedStore::start().await;
        let params = StreamParams {
            query: "binary".to_string(),
            ..StreamParams::default()
        };
        let (transport, cancel_tx, task) = run_stream(&store, params);

        transport.wait_for_len(2).await;
        assert_eq!(transport.entry_ids(), vec!["9"]);
        assert_eq!(transport.metadata_cursors(), vec!["c9"]);
        assert!(!transport.deliveries().contains(&Delivery::Cleanup));

        cancel_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }
}
