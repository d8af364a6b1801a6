//! PPoGATT 시뮬레이터
//!
//! 가짜 GATT 드라이버와 프로세스 내 서버로 엔진을 돌려본다.
//! - 양방향으로 패턴 데이터를 전송하고 링크 통계를 출력
//! - 손실률, MTU, Busy 빈도 조절 가능
//!
//! 사용법:
//!   cargo run --release --bin ppogatt-sim -- [OPTIONS]
//!
//! 예시:
//!   # 10% 손실, 작은 MTU
//!   cargo run --release --bin ppogatt-sim -- --loss 0.1 --mtu 23
//!
//!   # 상세 로그
//!   RUST_LOG=ppogatt=debug cargo run --bin ppogatt-sim -- --bytes 2000

use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use uuid::Uuid;

use ppogatt::{
    channel, CharacteristicHandle, Config, ConnectionId, Destination, Engine, EngineHandle, Event,
    GattClient, GattError, Meta, Packet, ResetCompletePayload, SeqNum, ServiceInstance,
    SessionHandler, SessionType, PPOGATT_MAX_VERSION, PPOGATT_MIN_VERSION,
};

const CONN: ConnectionId = ConnectionId(1);

const SERVICE: ServiceInstance = ServiceInstance {
    id: 0x000c,
    meta: CharacteristicHandle(0x000e),
    data: CharacteristicHandle(0x0010),
};

const APP_UUID: Uuid = Uuid::from_u128(0x7f9a_2c4e_61b8_4d0f_a3e5_90c2_1b7d_5e63);

/// 서버 재전송 주기
const SERVER_RTO: Duration = Duration::from_millis(100);

/// 진전 없는 재전송 라운드가 이만큼 쌓이면 서버가 리셋
const SERVER_MAX_ROUNDS: u32 = 5;

/// 시뮬레이터 설정
struct SimArgs {
    loss: f64,
    bytes: usize,
    mtu: u16,
    serial: String,
    busy_every: u32,
    timeout_secs: u64,
    legacy: bool,
    system: bool,
}

impl Default for SimArgs {
    fn default() -> Self {
        Self {
            loss: 0.0,
            bytes: 4096,
            mtu: 158,
            serial: "SIM000000001".to_string(),
            busy_every: 0,
            timeout_secs: 30,
            legacy: false,
            system: false,
        }
    }
}

fn value<T: FromStr>(args: &[String], i: usize, name: &str) -> T {
    match args.get(i + 1).map(|raw| raw.parse()) {
        Some(Ok(v)) => v,
        _ => {
            eprintln!("{}: 유효한 값 필요", name);
            std::process::exit(2);
        }
    }
}

/// NaN과 무한대는 거부, 나머지는 0.0~1.0으로 자른다
fn parse_loss(raw: &str) -> Option<f64> {
    raw.parse::<f64>()
        .ok()
        .filter(|loss| loss.is_finite())
        .map(|loss| loss.clamp(0.0, 1.0))
}

fn parse_args() -> SimArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut sim = SimArgs::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--loss" | "-l" => {
                sim.loss = match args.get(i + 1).and_then(|raw| parse_loss(raw)) {
                    Some(loss) => loss,
                    None => {
                        eprintln!("--loss: 0.0~1.0 사이 값 필요");
                        std::process::exit(2);
                    }
                };
                i += 1;
            }
            "--bytes" | "-n" => {
                sim.bytes = value(&args, i, "--bytes");
                i += 1;
            }
            "--mtu" | "-m" => {
                sim.mtu = value(&args, i, "--mtu");
                i += 1;
            }
            "--serial" | "-s" => {
                sim.serial = value(&args, i, "--serial");
                i += 1;
            }
            "--busy-every" => {
                sim.busy_every = value(&args, i, "--busy-every");
                i += 1;
            }
            "--timeout" => {
                sim.timeout_secs = value(&args, i, "--timeout");
                i += 1;
            }
            "--legacy" => sim.legacy = true,
            "--system" => sim.system = true,
            "--help" | "-h" => {
                println!(
                    r#"PPoGATT Simulator - Pebble Protocol over GATT

가짜 GATT 서버를 상대로 양방향 전송을 시뮬레이션

사용법:
  cargo run --release --bin ppogatt-sim -- [OPTIONS]

옵션:
  -l, --loss <RATIO>      패킷 손실률 0.0~1.0 (기본: 0.0)
  -n, --bytes <N>         방향별 전송 바이트 (기본: 4096)
  -m, --mtu <MTU>         ATT MTU (기본: 158)
  -s, --serial <SERIAL>   클라이언트 시리얼 (기본: SIM000000001)
  --busy-every <N>        N번째 쓰기마다 Busy 반환 (기본: 0 = 없음)
  --timeout <SECS>        최대 실행 시간 (기본: 30)
  --legacy                v0 프로토콜만 사용
  --system                시스템 세션 UUID 사용
  -h, --help              이 도움말 출력"#
                );
                std::process::exit(0);
            }
            other => {
                eprintln!("알 수 없는 옵션: {}", other);
                std::process::exit(2);
            }
        }
        i += 1;
    }
    sim
}

/// 패턴 데이터
fn pattern(len: usize, seed: u8) -> Bytes {
    (0..len)
        .map(|i| (i % 251) as u8 ^ seed)
        .collect::<Vec<u8>>()
        .into()
}

/// 가짜 GATT 드라이버
///
/// 완료 통지는 엔진 핸들로 되돌려 넣고, 쓰기는 서버 태스크로 보낸다.
struct SimGatt {
    handle: EngineHandle,
    to_server: mpsc::UnboundedSender<Bytes>,
    meta: Bytes,
    mtu: u16,
    loss: f64,
    busy_every: u32,
    writes: u32,
}

impl GattClient for SimGatt {
    fn read(
        &mut self,
        connection: ConnectionId,
        characteristic: CharacteristicHandle,
    ) -> Result<(), GattError> {
        self.handle
            .read_response(connection, characteristic, Ok(self.meta.clone()))
            .map_err(|e| {
                warn!("읽기 응답 제출 실패: {}", e);
                GattError::Disconnected
            })
    }

    fn write(
        &mut self,
        connection: ConnectionId,
        _characteristic: CharacteristicHandle,
        value: &[u8],
        _response_required: bool,
    ) -> Result<(), GattError> {
        self.writes += 1;
        if self.busy_every > 0 && self.writes % self.busy_every == 0 {
            let handle = self.handle.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                let _ = handle.submit(Event::BufferEmpty { connection }).await;
            });
            return Err(GattError::Busy);
        }

        if rand::thread_rng().gen_bool(self.loss) {
            debug!("클라이언트 → 서버 패킷 손실");
            return Ok(());
        }
        self.to_server
            .send(Bytes::copy_from_slice(value))
            .map_err(|_| GattError::Disconnected)
    }

    fn subscribe(
        &mut self,
        connection: ConnectionId,
        characteristic: CharacteristicHandle,
    ) -> Result<(), GattError> {
        self.handle
            .subscribe_response(connection, characteristic, Ok(()))
            .map_err(|_| GattError::Disconnected)
    }

    fn unsubscribe(
        &mut self,
        _connection: ConnectionId,
        _characteristic: CharacteristicHandle,
    ) -> Result<(), GattError> {
        Ok(())
    }

    fn mtu(&self, _connection: ConnectionId) -> u16 {
        self.mtu
    }
}

/// 수신 바이트를 모으는 세션
struct SimSession {
    outbound: BytesMut,
    received: Vec<u8>,
    opens: u32,
    closes: u32,
}

impl SessionHandler for SimSession {
    fn open(&mut self, uuid: Uuid, destination: Destination) {
        info!("세션 Open: {} ({:?})", uuid, destination);
        self.opens += 1;
    }

    fn close(&mut self, uuid: Uuid) {
        info!("세션 Close: {}", uuid);
        self.closes += 1;
    }

    fn deliver_bytes(&mut self, _uuid: Uuid, bytes: &[u8]) {
        self.received.extend_from_slice(bytes);
    }

    fn drain_next_bytes(&mut self, _uuid: Uuid, max_len: usize) -> Option<Bytes> {
        if self.outbound.is_empty() {
            return None;
        }
        let len = max_len.min(self.outbound.len());
        Some(self.outbound.split_to(len).freeze())
    }
}

/// 프로세스 내 서버 (go-back-N 송신, 즉시 ACK)
struct FakeServer {
    version: u8,
    rx_window: u8,
    tx_window: u8,
    max_payload: usize,

    open: bool,
    initiated: bool,
    window: u8,

    expected: SeqNum,
    last_accepted: Option<SeqNum>,
    received: Vec<u8>,

    outbound: Bytes,
    offset: usize,
    next_sn: SeqNum,
    in_flight: VecDeque<(SeqNum, Bytes)>,
    stalled_rounds: u32,
    resets: u32,
}

impl FakeServer {
    fn new(version: u8, max_payload: usize, outbound: Bytes) -> Self {
        Self {
            version,
            rx_window: 16,
            tx_window: 8,
            max_payload,
            open: false,
            initiated: false,
            window: 4,
            expected: SeqNum::ZERO,
            last_accepted: None,
            received: Vec::new(),
            outbound,
            offset: 0,
            next_sn: SeqNum::ZERO,
            in_flight: VecDeque::new(),
            stalled_rounds: 0,
            resets: 0,
        }
    }

    fn reset(&mut self) {
        self.open = false;
        self.expected = SeqNum::ZERO;
        self.last_accepted = None;
        self.next_sn = SeqNum::ZERO;
        self.in_flight.clear();
        self.stalled_rounds = 0;
    }

    fn reset_complete(&self) -> Packet {
        let payload = if self.version == 0 {
            ResetCompletePayload::V0
        } else {
            ResetCompletePayload::V1 {
                rx_window: self.rx_window,
                tx_window: self.tx_window,
            }
        };
        Packet::ResetComplete {
            sn: SeqNum::ZERO,
            payload,
        }
    }

    fn on_client_write(&mut self, value: &[u8]) -> Vec<Packet> {
        let packet = match Packet::decode(value, self.version) {
            Ok(Some(packet)) => packet,
            _ => return Vec::new(),
        };

        match packet {
            Packet::ResetRequest { payload, .. } => {
                if let Some(request) = payload {
                    debug!(
                        "서버: ResetRequest (v{}, {})",
                        request.version,
                        String::from_utf8_lossy(&request.client_id)
                    );
                }
                self.reset();
                self.initiated = false;
                vec![self.reset_complete()]
            }
            Packet::ResetComplete { payload, .. } => {
                self.window = match payload {
                    ResetCompletePayload::V0 => 4,
                    ResetCompletePayload::V1 { rx_window, .. } => self.tx_window.min(rx_window),
                };
                let mut replies = Vec::new();
                if self.initiated {
                    self.initiated = false;
                    replies.push(self.reset_complete());
                }
                self.open = true;
                replies.extend(self.fill());
                replies
            }
            Packet::Data { .. } | Packet::Ack { .. } if !self.open => Vec::new(),
            Packet::Data { sn, payload } if sn == self.expected => {
                self.received.extend_from_slice(&payload);
                self.expected = sn.next();
                self.last_accepted = Some(sn);
                vec![Packet::Ack { sn }]
            }
            Packet::Data { .. } => {
                // 이미 받은 패킷이면 마지막 ACK를 다시 보낸다
                self.last_accepted
                    .map(|sn| Packet::Ack { sn })
                    .into_iter()
                    .collect()
            }
            Packet::Ack { sn } => {
                if let Some(pos) = self.in_flight.iter().position(|(s, _)| *s == sn) {
                    self.in_flight.drain(..=pos);
                    self.stalled_rounds = 0;
                }
                self.fill()
            }
        }
    }

    fn fill(&mut self) -> Vec<Packet> {
        let mut packets = Vec::new();
        while self.in_flight.len() < self.window as usize && self.offset < self.outbound.len() {
            let end = (self.offset + self.max_payload).min(self.outbound.len());
            let payload = self.outbound.slice(self.offset..end);
            self.offset = end;

            let sn = self.next_sn;
            self.next_sn = sn.next();
            self.in_flight.push_back((sn, payload.clone()));
            packets.push(Packet::Data { sn, payload });
        }
        packets
    }

    fn on_timer(&mut self) -> Vec<Packet> {
        if !self.open || self.in_flight.is_empty() {
            return Vec::new();
        }

        self.stalled_rounds += 1;
        if self.stalled_rounds > SERVER_MAX_ROUNDS {
            warn!("서버: 재전송 한도 초과, 리셋");
            self.reset();
            self.initiated = true;
            self.resets += 1;
            return vec![Packet::ResetRequest {
                sn: SeqNum::ZERO,
                payload: None,
            }];
        }

        self.in_flight
            .iter()
            .map(|(sn, payload)| Packet::Data {
                sn: *sn,
                payload: payload.clone(),
            })
            .collect()
    }
}

async fn run_server(
    server: Arc<Mutex<FakeServer>>,
    mut from_client: mpsc::UnboundedReceiver<Bytes>,
    handle: EngineHandle,
    loss: f64,
) {
    let mut timer = tokio::time::interval(SERVER_RTO);

    loop {
        let replies = tokio::select! {
            value = from_client.recv() => match value {
                Some(value) => {
                    let mut server = server.lock();
                    server.on_client_write(&value)
                }
                None => break,
            },
            _ = timer.tick() => {
                let mut server = server.lock();
                server.on_timer()
            }
        };

        for packet in replies {
            if rand::thread_rng().gen_bool(loss) {
                debug!("서버 → 클라이언트 패킷 손실");
                continue;
            }
            if let Err(e) = handle.notification(CONN, SERVICE.data, packet.encode()) {
                warn!("notification 제출 실패: {}", e);
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = parse_args();

    let mut config = if args.legacy {
        Config::legacy()
    } else {
        Config::default()
    };
    config = config.with_serial(&args.serial);
    let version = config.max_version;

    info!("PPoGATT Simulator starting...");
    info!("Loss: {:.1}%", args.loss * 100.0);
    info!("MTU: {} (max payload {:?})", args.mtu, config.max_payload(args.mtu));
    info!("Bytes per direction: {}", args.bytes);

    let app_uuid = if args.system {
        config.system_uuid
    } else {
        APP_UUID
    };
    let meta = Meta {
        min_version: PPOGATT_MIN_VERSION,
        max_version: PPOGATT_MAX_VERSION,
        app_uuid,
        session_type: SessionType::InferredFromUuid,
    };

    let client_data = pattern(args.bytes, 0x00);
    let server_data = pattern(args.bytes, 0x5A);
    let max_payload = config.max_payload(args.mtu).unwrap_or(1);

    let (handle, events) = channel(&config);
    let (to_server, from_client) = mpsc::unbounded_channel();

    let gatt = SimGatt {
        handle: handle.clone(),
        to_server,
        meta: meta.encode().into(),
        mtu: args.mtu,
        loss: args.loss,
        busy_every: args.busy_every,
        writes: 0,
    };
    let session = SimSession {
        outbound: BytesMut::from(&client_data[..]),
        received: Vec::new(),
        opens: 0,
        closes: 0,
    };

    let engine = Engine::new(config, gatt, session, events)?;
    let engine_task = engine.spawn();

    let server = Arc::new(Mutex::new(FakeServer::new(
        version,
        max_payload,
        server_data.clone(),
    )));
    tokio::spawn(run_server(
        server.clone(),
        from_client,
        handle.clone(),
        args.loss,
    ));

    handle.service_discovered(CONN, SERVICE)?;

    let started = Instant::now();
    let deadline = started + Duration::from_secs(args.timeout_secs);
    loop {
        tokio::time::sleep(Duration::from_millis(200)).await;

        let client_rx = handle
            .snapshot()
            .get(&app_uuid)
            .map(|link| link.stats.bytes_received as usize)
            .unwrap_or(0);
        let server_rx = server.lock().received.len();
        debug!("진행: 서버 수신 {} / 클라이언트 수신 {}", server_rx, client_rx);

        if server_rx >= args.bytes && client_rx >= args.bytes {
            info!("전송 완료: {:.2}s", started.elapsed().as_secs_f64());
            break;
        }
        if Instant::now() >= deadline {
            warn!(
                "타임아웃: 서버 수신 {} / 클라이언트 수신 {} bytes",
                server_rx, client_rx
            );
            break;
        }
    }

    handle.shutdown().await;
    let (_gatt, session) = engine_task.await?;

    for link in handle.snapshot().links {
        info!(
            "{} {} {:?} v{} (tx {}, rx {})",
            link.id, link.uuid, link.state, link.version, link.tx_window, link.rx_window
        );
        info!("  {}", link.stats.summary());
    }

    let server = server.lock();
    info!(
        "Session: {} opens, {} closes | Server resets: {}",
        session.opens, session.closes, server.resets
    );
    if server.received == client_data[..] && session.received == server_data[..] {
        info!("검증 OK: 양방향 데이터 일치");
    } else {
        warn!(
            "검증 실패: 서버 {} / {} bytes, 클라이언트 {} / {} bytes",
            server.received.len(),
            client_data.len(),
            session.received.len(),
            server_data.len()
        );
    }

    Ok(())
}
