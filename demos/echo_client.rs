use bytes::Bytes;
use liveseq::{Client, Params};
use rand::Rng;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();

    let args: Vec<String> = std::env::args().collect();
    let server = flag_value(&args, "--server").unwrap_or_else(|| "127.0.0.1:9999".to_string());
    let mut messages = Vec::new();
    let mut i = 1;
    while i < args.len() {
        if args[i].starts_with("--") {
            i += 2;
        } else {
            messages.push(args[i].clone());
            i += 1;
        }
    }
    if messages.is_empty() {
        messages = vec!["hello".to_string(), "world".to_string()];
    }

    let isn = rand::thread_rng().gen_range(1..=256);
    let client = Client::connect(server.parse()?, isn, Params::default()).await?;
    println!("connected as conn {}", client.conn_id());

    for msg in &messages {
        client.write(Bytes::from(msg.clone().into_bytes()))?;
    }
    for _ in &messages {
        let echoed = client.read().await?;
        println!("echo: {}", String::from_utf8_lossy(&echoed));
    }

    client.close().await?;
    Ok(())
}

fn flag_value(args: &[String], flag: &str) -> Option<String> {
    args.windows(2)
        .find(|pair| pair[0] == flag)
        .map(|pair| pair[1].clone())
}
