//! Echo server demo.
//!
//! ```sh
//! cargo run --example echo_server -- 9696
//! ```

use netline::{Config, Context, Error, EventHandler, Inbound, Session};

struct EchoServer;

impl EventHandler for EchoServer {
    fn on_read(&mut self, ctx: &mut Context<'_, '_>, msg: &mut Inbound) -> Result<(), Error> {
        let Some(input) = msg.as_stream() else {
            return Ok(());
        };
        let mut data = vec![0u8; input.available()];
        let (pool, store) = ctx.buffers();
        let n = input.read(pool, store, &mut data)?;
        data.truncate(n);
        ctx.write(data)?;
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

    let port = std::env::args()
        .nth(1)
        .and_then(|p| p.parse().ok())
        .unwrap_or(9696);

    let event_loop = Config::builder()
        .name("echo-server")
        .host("0.0.0.0")
        .port(port)
        .server_initializer(|session: &mut Session| session.add_handler(EchoServer))
        .boot()?;

    event_loop.await_termination();
    Ok(())
}
