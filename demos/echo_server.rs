use liveseq::{LspError, Params, Server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();

    let args: Vec<String> = std::env::args().collect();
    let port: u16 = flag_value(&args, "--port")
        .map(|p| p.parse())
        .transpose()?
        .unwrap_or(9999);

    let server = Server::bind(port, Params::default()).await?;
    println!("echo server listening on {}", server.local_addr());

    loop {
        match server.read().await {
            Ok((conn_id, payload)) => {
                println!("conn {conn_id}: {}", String::from_utf8_lossy(&payload));
                server.write(conn_id, payload).await?;
            }
            Err(LspError::EndpointClosed) => break,
            Err(err) => eprintln!("{err}"),
        }
    }
    Ok(())
}

fn flag_value(args: &[String], flag: &str) -> Option<String> {
    args.windows(2)
        .find(|pair| pair[0] == flag)
        .map(|pair| pair[1].clone())
}
