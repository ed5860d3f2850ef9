//! Minimal responder: serves a greeting for every request.
//!
//! Point a web server at it, e.g. nginx:
//! ```text
//! location / { fastcgi_pass 127.0.0.1:9000; include fastcgi_params; }
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio_fcgi::{Bind, Request, Response, Server, ServerConfig};

#[tokio::main]
async fn main() -> tokio_fcgi::Result<()> {
    env_logger::init();

    let config = ServerConfig {
        bind: Bind::CreateSocket(([127, 0, 0, 1], 9000).into()),
        ..ServerConfig::default()
    };

    let count = Arc::new(AtomicUsize::new(1));
    Server::new(config, move |request: Request, response: Response| {
        let count = count.clone();
        async move {
            let n = count.fetch_add(1, Ordering::SeqCst);
            response.set_header("Content-Type", "text/plain")?;
            response
                .put(format!(
                    "Hello from {:?}: request {}\n",
                    request.request_uri().unwrap_or("?"),
                    n
                ))
                .await
        }
    })
    .run()
    .await
}
