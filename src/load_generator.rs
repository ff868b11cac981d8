use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;

// ─── Key pools ───────────────────────────────────────────────────

static GROUPS: &[&str] = &["pages", "api", "jobs", "host;COLON;8080"];

/// Some members carry escaped separators so the decode path gets traffic.
static MEMBERS: &[&str] = &[
    "home",
    "login",
    "search",
    "checkout",
    "v1;PERIOD;users",
    "v2;PERIOD;orders",
    "ratio;COLON;hit",
];

/// How many rows one datagram carries at most.
const MAX_ROWS: usize = 4;

/// Pause between datagrams per worker.
const SEND_PAUSE: Duration = Duration::from_micros(500);

// ─── Public entry point ──────────────────────────────────────────

/// Spawns `concurrency` Tokio tasks that fire counter datagrams at `target`
/// until the deadline or the `running` flag is set to false.
pub async fn run(
    running: Arc<AtomicBool>,
    sent: Arc<AtomicU64>,
    target: SocketAddr,
    concurrency: u32,
    duration_secs: u64,
    sample_rate: f64,
) {
    let deadline = Instant::now() + Duration::from_secs(duration_secs);
    let target = loopback_if_unspecified(target);

    let mut handles = Vec::with_capacity(concurrency as usize);

    for worker_id in 0..concurrency {
        let running = running.clone();
        let sent = sent.clone();

        handles.push(tokio::spawn(async move {
            if let Err(err) = worker(worker_id, running, sent, target, deadline, sample_rate).await {
                tracing::warn!(worker_id, %err, "load generator worker stopped");
            }
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    running.store(false, Ordering::SeqCst);
    tracing::info!(sent = sent.load(Ordering::Relaxed), "load generator finished");
}

/// `0.0.0.0:8125` and `[::]:8125` are fine bind addresses but not
/// destinations.
fn loopback_if_unspecified(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => SocketAddr::new(Ipv4Addr::LOCALHOST.into(), addr.port()),
        IpAddr::V6(ip) if ip.is_unspecified() => SocketAddr::new(Ipv6Addr::LOCALHOST.into(), addr.port()),
        _ => addr,
    }
}

/// Ephemeral local address in the same family as `target`.
fn local_bind_addr(target: SocketAddr) -> SocketAddr {
    let ip: IpAddr = match target {
        SocketAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
        SocketAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
    };
    SocketAddr::new(ip, 0)
}

// ─── Worker loop ─────────────────────────────────────────────────

async fn worker(
    id: u32,
    running: Arc<AtomicBool>,
    sent: Arc<AtomicU64>,
    target: SocketAddr,
    deadline: Instant,
    sample_rate: f64,
) -> std::io::Result<()> {
    // Each worker gets its own deterministic RNG seeded uniquely.
    let mut rng = StdRng::seed_from_u64(1000 + id as u64);
    let socket = UdpSocket::bind(local_bind_addr(target)).await?;

    while running.load(Ordering::Relaxed) && Instant::now() < deadline {
        tokio::time::sleep(SEND_PAUSE).await;

        // Client-side sampling: skip the send, the server scales up.
        if sample_rate < 1.0 && !rng.gen_bool(sample_rate) {
            continue;
        }

        let datagram = build_datagram(&mut rng, sample_rate);
        socket.send_to(datagram.as_bytes(), target).await?;
        sent.fetch_add(1, Ordering::Relaxed);
    }

    Ok(())
}

// ─── Datagram construction ───────────────────────────────────────

pub fn build_datagram(rng: &mut impl Rng, sample_rate: f64) -> String {
    let rows = rng.gen_range(1..=MAX_ROWS);
    let mut out = String::new();

    for i in 0..rows {
        if i > 0 {
            out.push('\n');
        }

        let member = MEMBERS[rng.gen_range(0..MEMBERS.len())];
        // One in five keys goes to the default group.
        if rng.gen_bool(0.2) {
            out.push_str(member);
        } else {
            out.push_str(GROUPS[rng.gen_range(0..GROUPS.len())]);
            out.push('.');
            out.push_str(member);
        }

        // Occasionally pack two records under one key.
        let records = if rng.gen_bool(0.25) { 2 } else { 1 };
        for _ in 0..records {
            out.push_str(&format!(":{}|c", rng.gen_range(1..=5u32)));
            if sample_rate < 1.0 {
                out.push_str(&format!("|@{sample_rate}"));
            }
        }
    }

    out
}
