use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use ulid::Ulid;

use wayfare::auth::SharedSecret;
use wayfare::engine::{Engine, PlatformFees};
use wayfare::notify::NotifyHub;
use wayfare::wire;

const SECRET: &str = "test-secret";

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<Engine>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join("wayfare_int_test");
    std::fs::create_dir_all(&dir).unwrap();
    let wal_path = dir.join(format!("{}.wal", Ulid::new()));

    let engine = Arc::new(
        Engine::new(
            wal_path,
            Arc::new(NotifyHub::new()),
            Arc::new(PlatformFees::new(5.0, 10.0)),
        )
        .unwrap(),
    );

    let served = engine.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = served.clone();
            tokio::spawn(async move {
                let auth = SharedSecret::new(SECRET.to_string());
                let _ = wire::process_connection(socket, engine, auth, None).await;
            });
        }
    });

    (addr, engine)
}

struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        Self::connect_with_secret(addr, SECRET).await
    }

    async fn connect_with_secret(addr: SocketAddr, secret: &str) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, write) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(read),
            writer: write,
        };
        let hello = client
            .request(json!({"op": "hello", "secret": secret}))
            .await;
        // The caller inspects failures through later requests; the
        // handshake reply is surfaced only for the bad-secret test.
        if hello["ok"] == json!(false) {
            panic!("handshake rejected: {hello}");
        }
        client
    }

    /// Raw hello exchange without panicking on rejection.
    async fn try_handshake(addr: SocketAddr, secret: &str) -> Value {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, write) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(read),
            writer: write,
        };
        client.send(json!({"op": "hello", "secret": secret})).await;
        client.read_line().await.unwrap()
    }

    async fn send(&mut self, body: Value) {
        let mut line = serde_json::to_string(&body).unwrap();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await.unwrap();
    }

    async fn read_line(&mut self) -> Option<Value> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await.unwrap();
        if n == 0 {
            return None;
        }
        Some(serde_json::from_str(&line).unwrap())
    }

    async fn request(&mut self, body: Value) -> Value {
        self.send(body).await;
        self.read_line().await.expect("server closed connection")
    }

    async fn next_with_timeout(&mut self, wait: Duration) -> Option<Value> {
        tokio::time::timeout(wait, self.read_line()).await.ok()?
    }
}

fn published_story(name: &str) -> Value {
    json!({
        "op": "create_story",
        "host_id": Ulid::new(),
        "name": name,
        "status": "published",
        "availability": {"type": "year_round", "trip_days": 1, "daily_capacity": 10},
        "pricing": {"mode": "per_person", "unit_amount": 100.0, "total_amount": null},
        "coords": {"lat": 9.93, "lon": 76.26},
        "district": "Ernakulam",
        "state": "Kerala",
        "town": "Kochi",
        "tags": ["harbour"]
    })
}

fn booking_for(story_id: &str, date: &str, party: u64) -> Value {
    let travellers: Vec<Value> = (0..party)
        .map(|i| {
            json!({
                "full_name": format!("Traveller {i}"),
                "email": format!("t{i}@example.com"),
                "phone": "+9100000000"
            })
        })
        .collect();
    json!({
        "op": "create_booking",
        "story_id": story_id,
        "requester_id": Ulid::new(),
        "start_date": date,
        "end_date": date,
        "party_size": party,
        "travellers": travellers,
        "flow": "direct"
    })
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn bad_secret_is_rejected() {
    let (addr, _engine) = start_test_server().await;
    let reply = Client::try_handshake(addr, "wrong").await;
    assert_eq!(reply["ok"], json!(false));
    assert_eq!(reply["error"], json!("unauthorized"));
}

#[tokio::test]
async fn booking_round_trip_with_server_pricing() {
    let (addr, _engine) = start_test_server().await;
    let mut client = Client::connect(addr).await;

    let created = client.request(published_story("Harbour Walk")).await;
    assert_eq!(created["ok"], json!(true));
    let story_id = created["story"]["id"].as_str().unwrap().to_string();

    let booked = client
        .request(booking_for(&story_id, "2026-04-01", 2))
        .await;
    assert_eq!(booked["ok"], json!(true), "got {booked}");
    let booking = &booked["booking"];
    assert_eq!(booking["party_size"], json!(2));
    assert_eq!(booking["confirmation"], json!("confirmed"));
    // 2 × 100 base, 5% + 10 fees.
    assert_eq!(booking["pricing"]["base_total"], json!(200.0));
    assert_eq!(booking["pricing"]["grand_total"], json!(220.0));

    let occ = client
        .request(json!({
            "op": "occupancy",
            "story_id": story_id,
            "date": "2026-04-01"
        }))
        .await;
    assert_eq!(occ["occupancy"], json!(2));
}

#[tokio::test]
async fn overbooking_rejected_over_wire() {
    let (addr, _engine) = start_test_server().await;
    let mut client = Client::connect(addr).await;

    let created = client.request(published_story("Full Boat")).await;
    let story_id = created["story"]["id"].as_str().unwrap().to_string();

    let first = client
        .request(booking_for(&story_id, "2026-04-01", 10))
        .await;
    assert_eq!(first["ok"], json!(true));

    let second = client
        .request(booking_for(&story_id, "2026-04-01", 1))
        .await;
    assert_eq!(second["ok"], json!(false));
    assert_eq!(second["error"], json!("capacity_exceeded"));
}

#[tokio::test]
async fn stale_client_quote_rejected() {
    let (addr, _engine) = start_test_server().await;
    let mut client = Client::connect(addr).await;

    let created = client.request(published_story("Quoted Trip")).await;
    let story_id = created["story"]["id"].as_str().unwrap().to_string();

    let mut body = booking_for(&story_id, "2026-04-01", 2);
    body["client_total"] = json!(200.0); // missing the fee component
    let reply = client.request(body).await;
    assert_eq!(reply["ok"], json!(false));
    assert_eq!(reply["error"], json!("pricing_mismatch"));
}

#[tokio::test]
async fn malformed_and_invalid_inputs() {
    let (addr, _engine) = start_test_server().await;
    let mut client = Client::connect(addr).await;

    let garbage = client.request(json!({"op": "make_coffee"})).await;
    assert_eq!(garbage["error"], json!("bad_request"));

    let created = client.request(published_story("Dated Trip")).await;
    let story_id = created["story"]["id"].as_str().unwrap().to_string();

    let mut body = booking_for(&story_id, "2026-04-01", 1);
    body["start_date"] = json!("not-a-date");
    let reply = client.request(body).await;
    assert_eq!(reply["error"], json!("invalid_date"));

    let search = client
        .request(json!({
            "op": "search",
            "origin": {"lat": 95.0, "lon": 76.0},
            "search_date": "2026-04-01",
            "party_size": 2
        }))
        .await;
    assert_eq!(search["error"], json!("invalid_coordinates"));
}

#[tokio::test]
async fn search_over_wire_ranks_and_prices() {
    let (addr, _engine) = start_test_server().await;
    let mut client = Client::connect(addr).await;

    client.request(published_story("Harbour Walk")).await;
    client.request(published_story("Spice Market Tour")).await;

    let resp = client
        .request(json!({
            "op": "search",
            "origin": {
                "lat": 9.93,
                "lon": 76.26,
                "district_hint": "Ernakulam",
                "state_hint": "Kerala"
            },
            "search_date": "2026-04-01",
            "party_size": 2,
            "sort_by": "relevance"
        }))
        .await;
    assert_eq!(resp["ok"], json!(true), "got {resp}");
    assert_eq!(resp["total"], json!(2));
    let first = &resp["results"][0];
    assert_eq!(first["calculated_total"], json!(200.0));
    assert!(first["final_score"].as_f64().unwrap() > 0.0);
    assert!(first["price_note"].as_str().unwrap().contains("April 2026"));
}

#[tokio::test]
async fn subscribe_streams_booking_events() {
    let (addr, _engine) = start_test_server().await;

    let mut watcher = Client::connect(addr).await;
    let mut booker = Client::connect(addr).await;

    let created = booker.request(published_story("Watched Boat")).await;
    let story_id = created["story"]["id"].as_str().unwrap().to_string();

    let sub = watcher
        .request(json!({"op": "subscribe", "story_id": story_id}))
        .await;
    assert_eq!(sub["ok"], json!(true));

    let booked = booker
        .request(booking_for(&story_id, "2026-04-01", 2))
        .await;
    assert_eq!(booked["ok"], json!(true));

    let event = watcher
        .next_with_timeout(Duration::from_secs(5))
        .await
        .expect("no event within timeout");
    assert!(
        event["event"]["BookingCreated"].is_object(),
        "unexpected event: {event}"
    );
}

#[tokio::test]
async fn payment_resolution_over_wire() {
    let (addr, _engine) = start_test_server().await;
    let mut client = Client::connect(addr).await;

    let created = client.request(published_story("Checkout Boat")).await;
    let story_id = created["story"]["id"].as_str().unwrap().to_string();

    let mut body = booking_for(&story_id, "2026-04-01", 2);
    body["flow"] = json!("checkout");
    let booked = client.request(body).await;
    assert_eq!(booked["booking"]["payment"], json!("pending"));
    let booking_id = booked["booking"]["id"].as_str().unwrap().to_string();

    let resolved = client
        .request(json!({
            "op": "resolve_payment",
            "id": booking_id,
            "outcome": "success"
        }))
        .await;
    assert_eq!(resolved["ok"], json!(true));

    let fetched = client
        .request(json!({"op": "get_booking", "id": booking_id}))
        .await;
    assert_eq!(fetched["booking"]["payment"], json!("success"));
}

#[tokio::test]
async fn concurrent_wire_bookings_never_overbook() {
    let (addr, _engine) = start_test_server().await;
    let mut setup = Client::connect(addr).await;

    let created = setup.request(published_story("Contended Boat")).await;
    let story_id = created["story"]["id"].as_str().unwrap().to_string();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let story_id = story_id.clone();
        handles.push(tokio::spawn(async move {
            let mut client = Client::connect(addr).await;
            client
                .request(booking_for(&story_id, "2026-05-01", 2))
                .await
        }));
    }

    let mut accepted = 0u64;
    for h in handles {
        let reply = h.await.unwrap();
        if reply["ok"] == json!(true) {
            accepted += reply["booking"]["party_size"].as_u64().unwrap();
        } else {
            assert_eq!(reply["error"], json!("capacity_exceeded"));
        }
    }
    assert_eq!(accepted, 10, "capacity 10 must be filled exactly, never exceeded");
}
