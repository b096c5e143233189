#[tokio::main]
async fn main() -> Result<(), server::error::ServerError> {
    server::start_server().await
}
