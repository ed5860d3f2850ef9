//! Echoes the request body and lists the received variables.

use tokio_fcgi::{Bind, Request, Response, Server, ServerConfig};

#[tokio::main]
async fn main() -> tokio_fcgi::Result<()> {
    env_logger::init();

    let config = ServerConfig {
        bind: Bind::CreateSocket(([127, 0, 0, 1], 9000).into()),
        trace_request_headers: true,
        ..ServerConfig::default()
    };

    Server::new(config, |mut request: Request, response: Response| async move {
        let body = request.stdin().get_all().await?;
        response.set_header("Content-Type", "text/plain")?;

        let mut out = String::new();
        for (name, value) in request.variables() {
            out.push_str(&format!("{}: {}\n", name, value));
        }
        out.push('\n');
        response.put(out).await?;
        response.put(body).await?;
        Ok(())
    })
    .run()
    .await
}
