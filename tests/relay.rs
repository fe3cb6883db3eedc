use std::net::SocketAddr;
use std::time::Duration;

use subrelay::tunnel::{method, Arg};
use subrelay::{encode, ClientRegistry, Config, FrameDecoder, Message, Relay};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

struct Running {
    control: SocketAddr,
    public: SocketAddr,
    admin: Option<SocketAddr>,
    registry: ClientRegistry,
}

async fn start(mut config: Config) -> Running {
    config.http.client_addr = "127.0.0.1".to_string();
    config.http.client_port = 0;
    config.http.server_addr = "127.0.0.1".to_string();
    config.http.server_port = 0;

    let relay = Relay::bind(&config).await.unwrap();
    let running = Running {
        control: relay.control_addr().unwrap(),
        public: relay.public_addr().unwrap(),
        admin: relay.admin_addr(),
        registry: relay.registry(),
    };
    tokio::spawn(relay.serve(std::future::pending::<()>()));
    running
}

struct Peer {
    stream: TcpStream,
    decoder: FrameDecoder,
}

impl Peer {
    async fn connect(addr: SocketAddr) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.unwrap(),
            decoder: FrameDecoder::default(),
        }
    }

    async fn send(&mut self, method: &str, args: &[&str]) {
        let msg = Message {
            sender: "client".to_string(),
            version: 1,
            method: method.to_string(),
            args: args.iter().map(|a| Arg::from(*a)).collect(),
        };
        self.stream.write_all(&encode(&msg).unwrap()).await.unwrap();
    }

    async fn recv(&mut self) -> Option<Message> {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(frame) = self.decoder.next_frame() {
                return Some(frame.unwrap());
            }
            let n = tokio::time::timeout(Duration::from_secs(5), self.stream.read(&mut buf))
                .await
                .expect("timed out waiting for the relay")
                .unwrap_or(0);
            if n == 0 {
                return None;
            }
            self.decoder.extend(&buf[..n]);
        }
    }

    async fn register(&mut self, args: &[&str]) -> String {
        self.send(method::REGISTER, args).await;
        let notify = self.recv().await.unwrap();
        assert_eq!(notify.method, method::NOTIFY);
        notify.args[0].as_str().unwrap().to_string()
    }
}

fn get(public: SocketAddr, host: &str, path: &str) -> reqwest::RequestBuilder {
    reqwest::Client::new()
        .get(format!("http://{}{}", public, path))
        .header("Host", host)
}

#[tokio::test]
async fn test_generated_id_is_announced() {
    let relay = start(Config::default()).await;
    let mut peer = Peer::connect(relay.control).await;

    peer.send(method::REGISTER, &["abc"]).await;
    let notify = peer.recv().await.unwrap();
    let id = notify.args[0].as_str().unwrap();
    let url = notify.args[1].as_str().unwrap();

    assert_eq!(id.len(), 20);
    assert!(id.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()));
    let expected = format!("http://{}.test.loc:{}", id, relay.public.port());
    assert_eq!(url, expected);
    assert_eq!(relay.registry.ids().await, vec![id.to_string()]);
}

#[tokio::test]
async fn test_custom_id_conflict() {
    let mut config = Config::default();
    config.http.custom_ids = true;
    let relay = start(config).await;

    let mut a = Peer::connect(relay.control).await;
    assert_eq!(a.register(&["foo"]).await, "foo");

    let mut b = Peer::connect(relay.control).await;
    let b_id = b.register(&["foo"]).await;
    assert_ne!(b_id, "foo");
    assert_eq!(b_id.len(), 20);

    // foo still answers through a
    let pending = tokio::spawn(get(relay.public, "foo.test.loc", "/").send());
    let request = a.recv().await.unwrap();
    assert_eq!(request.method, method::HTTP_REQUEST);
    a.send(
        method::HTTP_RESPONSE,
        &["HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\na"],
    )
    .await;
    let resp = pending.await.unwrap().unwrap();
    assert_eq!(resp.text().await.unwrap(), "a");
}

#[tokio::test]
async fn test_unknown_subdomain() {
    let relay = start(Config::default()).await;
    let resp = get(relay.public, "unknown.test.loc", "/").send().await.unwrap();
    assert_eq!(resp.status(), 404);
    assert_eq!(resp.text().await.unwrap(), "Client not found");
}

#[tokio::test]
async fn test_http_round_trip() {
    let mut config = Config::default();
    config.http.custom_ids = true;
    let relay = start(config).await;

    let mut peer = Peer::connect(relay.control).await;
    assert_eq!(peer.register(&["svc"]).await, "svc");

    let pending = tokio::spawn(get(relay.public, "svc.test.loc", "/hello?x=1").send());

    let request = peer.recv().await.unwrap();
    assert_eq!(request.method, method::HTTP_REQUEST);
    let dump = request.args[0].as_str().unwrap();
    assert!(dump.starts_with("GET /hello?x=1 HTTP/1.1\r\nHost: svc.test.loc\r\n"));

    peer.send(
        method::HTTP_RESPONSE,
        &["HTTP/1.1 200 OK\r\nX-Test: 1\r\nContent-Length: 5\r\n\r\nhello"],
    )
    .await;

    let resp = pending.await.unwrap().unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["x-test"], "1");
    assert_eq!(resp.text().await.unwrap(), "hello");
}

#[tokio::test]
async fn test_wrong_password_never_registers() {
    let mut config = Config::default();
    config.http.password = "hunter2".to_string();
    let relay = start(config).await;

    let mut peer = Peer::connect(relay.control).await;
    peer.send(method::REGISTER, &["abc", "nope"]).await;
    let reject = peer.recv().await.unwrap();
    assert_eq!(reject.method, method::AUTH_REJECT);
    assert!(peer.recv().await.is_none());
    assert!(relay.registry.is_empty().await);
}

#[tokio::test]
async fn test_disconnect_unregisters() {
    let relay = start(Config::default()).await;
    let mut peer = Peer::connect(relay.control).await;
    let id = peer.register(&[]).await;
    assert!(relay.registry.contains(&id).await);

    drop(peer);
    for _ in 0..100 {
        if relay.registry.lookup(&id).await.is_none() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{id} still registered after disconnect");
}

#[tokio::test]
async fn test_silent_client_times_out() {
    let mut config = Config::default();
    config.http.response_timeout = 1;
    let relay = start(config).await;

    let mut peer = Peer::connect(relay.control).await;
    let id = peer.register(&[]).await;

    let host = format!("{}.test.loc", id);
    let resp = get(relay.public, &host, "/").send().await.unwrap();
    assert_eq!(resp.status(), 504);
}

#[tokio::test]
async fn test_client_disconnecting_mid_request_is_bad_gateway() {
    let relay = start(Config::default()).await;
    let mut peer = Peer::connect(relay.control).await;
    let id = peer.register(&[]).await;

    let host = format!("{}.test.loc", id);
    let pending = tokio::spawn(get(relay.public, &host, "/").send());
    let request = peer.recv().await.unwrap();
    assert_eq!(request.method, method::HTTP_REQUEST);
    drop(peer);

    let resp = pending.await.unwrap().unwrap();
    assert_eq!(resp.status(), 502);
    assert_eq!(resp.text().await.unwrap(), "Tunnel client disconnected");
}

#[tokio::test]
async fn test_admin_lists_tunnels() {
    let mut config = Config::default();
    config.http.custom_ids = true;
    config.http.admin_addr = Some("127.0.0.1:0".parse().unwrap());
    let relay = start(config).await;

    let mut peer = Peer::connect(relay.control).await;
    peer.register(&["listed"]).await;

    let admin = relay.admin.unwrap();
    let body = reqwest::get(format!("http://{}/tunnels", admin))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    let tunnels: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(tunnels.as_array().unwrap().len(), 1);
    assert_eq!(tunnels[0]["id"], "listed");
    assert!(tunnels[0]["registered_at"].as_u64().unwrap() > 0);
}
