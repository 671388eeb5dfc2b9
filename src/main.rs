#[tokio::main]
async fn main() {
    if let Err(e) = hive_dispatch::run().await {
        eprintln!("hive-dispatch: {}", e);
        std::process::exit(1);
    }
}
