//! Full bridge against a fake host over loopback TCP.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use photoshop_bridge::bridge::codec::{Message, read_message, write_message};
use photoshop_bridge::bridge::protocol::{HostEnvelope, Operation, RequestEnvelope};
use photoshop_bridge::bridge::transport::HostEndpoint;
use photoshop_bridge::{Bridge, BridgeConfig, BridgeError, Terminator, Value};

const DOCUMENT_XML: &str = r#"<type name="Document"><factory>
    <accessor name="name" access="readonly"/>
    <method name="close"/>
</factory></type>"#;

#[derive(Default)]
struct RecordingTerminator {
    codes: Mutex<Vec<i32>>,
}

impl Terminator for RecordingTerminator {
    fn terminate(&self, code: i32) {
        self.codes.lock().unwrap().push(code);
    }
}

/// Host side: records everything, answers pings and requests.
struct FakeHost {
    port: u16,
    controller: watch::Receiver<Option<u16>>,
    operations: Arc<Mutex<Vec<Operation>>>,
    control: Arc<Mutex<Vec<Message>>>,
}

impl FakeHost {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (port_tx, controller) = watch::channel(None);
        let operations = Arc::new(Mutex::new(Vec::new()));
        let control = Arc::new(Mutex::new(Vec::new()));

        let port_tx = Arc::new(port_tx);
        tokio::spawn({
            let operations = Arc::clone(&operations);
            let control = Arc::clone(&control);
            let controller = controller.clone();
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    tokio::spawn(serve(
                        stream,
                        Arc::clone(&port_tx),
                        controller.clone(),
                        Arc::clone(&operations),
                        Arc::clone(&control),
                    ));
                }
            }
        });

        Self {
            port,
            controller,
            operations,
            control,
        }
    }

    fn count(&self, kind: &str) -> usize {
        self.operations
            .lock()
            .unwrap()
            .iter()
            .filter(|op| op.kind() == kind)
            .count()
    }

    /// Push an unsolicited message to the controller's listener.
    async fn push(&self, message: Message) {
        let mut controller = self.controller.clone();
        let port = controller
            .wait_for(Option::is_some)
            .await
            .unwrap()
            .unwrap();
        HostEndpoint::localhost(port)
            .send_message(&message)
            .await
            .unwrap();
    }
}

async fn serve(
    mut stream: TcpStream,
    port_tx: Arc<watch::Sender<Option<u16>>>,
    mut controller: watch::Receiver<Option<u16>>,
    operations: Arc<Mutex<Vec<Operation>>>,
    control: Arc<Mutex<Vec<Message>>>,
) {
    let Ok(message) = read_message(&mut stream).await else {
        return;
    };
    match message {
        Message::SetPort(port) => {
            port_tx.send_replace(Some(port));
        }
        Message::Ping => {
            let _ = write_message(&mut stream, &Message::Pong).await;
        }
        Message::Request(xml) => {
            let envelope = RequestEnvelope::from_xml(&xml).unwrap();
            let op: Operation = serde_json::from_str(&envelope.data).unwrap();
            let data = respond(&op);
            operations.lock().unwrap().push(op);

            let port = controller
                .wait_for(Option::is_some)
                .await
                .unwrap()
                .unwrap();
            let reply = HostEnvelope::RequestResponse {
                uid: envelope.uid.to_string(),
                data,
            };
            HostEndpoint::localhost(port)
                .send_message(&Message::Response(reply.to_xml()))
                .await
                .unwrap();
        }
        other => control.lock().unwrap().push(other),
    }
}

fn respond(op: &Operation) -> String {
    match op {
        Operation::AddButton { .. } => r#"{"type":"String","value":"btn-1"}"#.to_string(),
        Operation::ClassDef { cls } if cls == "Document" => DOCUMENT_XML.to_string(),
        Operation::ObjCreate { .. } => r#"{"obj_uid":"doc-1"}"#.to_string(),
        Operation::GetProp { prop, .. } if prop == "name" => {
            r#"{"type":"String","value":"Untitled-1"}"#.to_string()
        }
        Operation::Static { prop, .. } if prop == "version" => {
            r#"{"type":"String","value":"25.1"}"#.to_string()
        }
        Operation::ClearPanel | Operation::SetMessage { .. } => String::new(),
        _ => r#"{"type":"error","stack":"Error: not supported"}"#.to_string(),
    }
}

fn config() -> BridgeConfig {
    BridgeConfig {
        request_timeout: Duration::from_secs(5),
        wait_slice: Duration::from_millis(20),
        heartbeat_interval: Duration::from_millis(50),
        ..BridgeConfig::default()
    }
}

async fn connect(host: &FakeHost) -> (Bridge, Arc<RecordingTerminator>) {
    let terminator = Arc::new(RecordingTerminator::default());
    let bridge = Bridge::start_with_terminator(
        host.port,
        config(),
        Arc::clone(&terminator) as Arc<dyn Terminator>,
    )
    .await
    .unwrap();
    (bridge, terminator)
}

#[tokio::test]
async fn start_registers_port_with_host() {
    let host = FakeHost::start().await;
    let (bridge, _) = connect(&host).await;

    let mut controller = host.controller.clone();
    let reported = *controller.wait_for(Option::is_some).await.unwrap();
    assert_eq!(reported, bridge.local_port());

    bridge.shutdown();
    bridge.join().await;
}

#[tokio::test]
async fn add_button_callback_fires_exactly_once() {
    let host = FakeHost::start().await;
    let (bridge, _) = connect(&host).await;

    let count = Arc::new(AtomicUsize::new(0));
    let hits = Arc::clone(&count);
    let uid = bridge
        .add_button("Save", move || {
            hits.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();
    assert_eq!(uid, "btn-1");
    assert_eq!(
        host.operations.lock().unwrap()[0],
        Operation::AddButton {
            label: "Save".to_string()
        }
    );

    host.push(Message::Response(
        HostEnvelope::Callback {
            uid: "btn-1".to_string(),
        }
        .to_xml(),
    ))
    .await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while count.load(Ordering::SeqCst) == 0 && tokio::time::Instant::now() < deadline {
        bridge.main_queue().run_pending();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    bridge.main_queue().run_pending();
    assert_eq!(count.load(Ordering::SeqCst), 1);

    bridge.shutdown();
    bridge.join().await;
}

#[tokio::test]
async fn one_classdef_for_many_objects() {
    let host = FakeHost::start().await;
    let (bridge, _) = connect(&host).await;

    let first = bridge.construct("Document", vec![]).await.unwrap();
    let second = bridge
        .construct("Document", vec![Value::Int(640), Value::Int(480)])
        .await
        .unwrap();

    assert_eq!(host.count("classdef"), 1);
    assert_eq!(host.count("objcreate"), 2);
    assert_eq!(first.get("name").await.unwrap(), Value::from("Untitled-1"));
    assert!(matches!(
        second.call("close", vec![]).await,
        Err(BridgeError::Remote { stack }) if stack.contains("not supported")
    ));
    assert_eq!(
        bridge.static_property("Document", "version").await.unwrap(),
        Value::from("25.1")
    );

    bridge.shutdown();
    bridge.join().await;
}

#[tokio::test]
async fn heartbeat_keeps_a_responsive_host() {
    let host = FakeHost::start().await;
    let (bridge, terminator) = connect(&host).await;

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(terminator.codes.lock().unwrap().is_empty());

    bridge.shutdown();
    bridge.join().await;
}

#[tokio::test]
async fn host_quit_shuts_the_bridge_down() {
    let host = FakeHost::start().await;
    let (bridge, _) = connect(&host).await;

    bridge.request_foreground().await.unwrap();
    host.push(Message::Quit).await;

    tokio::time::timeout(Duration::from_secs(2), bridge.join())
        .await
        .expect("bridge should stop after host quit");
    assert!(bridge.shutdown_token().is_cancelled());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while host.control.lock().unwrap().is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(*host.control.lock().unwrap(), vec![Message::ActivatePython]);
}

#[tokio::test]
async fn start_fails_without_a_host() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let terminator = Arc::new(RecordingTerminator::default());
    let result = Bridge::start_with_terminator(port, config(), terminator.clone()).await;
    assert!(matches!(result, Err(BridgeError::Connection(_))));
    assert!(terminator.codes.lock().unwrap().is_empty());
}
