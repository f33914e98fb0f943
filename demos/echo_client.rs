//! Echo client demo: opens ten connections, blasts a fixed frame through
//! each, and reports throughput when the loop shuts down.
//!
//! ```sh
//! cargo run --example echo_client -- 127.0.0.1 9696
//! ```

use std::time::{Duration, Instant};

use netline::{Config, Context, Error, EventHandler, Inbound, Session};
use tracing::{debug, info};

const FRAME: usize = 256;

struct EchoClient {
    frame: [u8; FRAME],
    started: Option<Instant>,
    round_trips: u64,
}

impl EchoClient {
    fn new() -> EchoClient {
        let mut frame = [0u8; FRAME];
        for (i, b) in frame.iter_mut().enumerate() {
            *b = i as u8;
        }
        EchoClient {
            frame,
            started: None,
            round_trips: 0,
        }
    }
}

impl EventHandler for EchoClient {
    fn on_connected(&mut self, ctx: &mut Context<'_, '_>) -> Result<(), Error> {
        debug!(session = ctx.session_id(), "connected");
        self.started = Some(Instant::now());
        ctx.write(&self.frame[..])?;
        ctx.flush()
    }

    fn on_read(&mut self, ctx: &mut Context<'_, '_>, msg: &mut Inbound) -> Result<(), Error> {
        let Some(input) = msg.as_stream() else {
            return Ok(());
        };
        if input.available() < FRAME {
            return Ok(());
        }

        let mut echoed = [0u8; FRAME];
        while input.available() >= FRAME {
            let (pool, store) = ctx.buffers();
            input.read(pool, store, &mut echoed)?;
            if echoed != self.frame {
                return Err(Error::Handler("echo mismatch".into()));
            }
            self.round_trips += 1;
            ctx.write(&self.frame[..])?;
        }

        if ctx.is_shutdown() {
            let secs = self
                .started
                .map_or(0.0, |t| t.elapsed().as_secs_f64())
                .max(f64::EPSILON);
            info!(
                session = ctx.session_id(),
                round_trips = self.round_trips,
                per_sec = (self.round_trips as f64 / secs) as u64,
                "done"
            );
            ctx.close();
            return Ok(());
        }
        ctx.flush()
    }
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let host = std::env::args().nth(1).unwrap_or_else(|| "127.0.0.1".into());
    let port = std::env::args()
        .nth(2)
        .and_then(|p| p.parse().ok())
        .unwrap_or(9696);

    let event_loop = Config::builder()
        .name("echo-client")
        .host(host)
        .port(port)
        .client_initializer(|session: &mut Session| session.add_handler(EchoClient::new()))
        .boot()?;

    for _ in 0..10 {
        event_loop.connect()?;
    }

    // run for a minute, then drain and stop
    std::thread::sleep(Duration::from_secs(60));
    info!("shutting down echo client");
    event_loop.shutdown();
    event_loop.await_termination();
    Ok(())
}
