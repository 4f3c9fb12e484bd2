use mock_wiki::MockWiki;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let port = std::env::var("PORT").unwrap_or_else(|_| "3000".to_string());
    let user = std::env::var("MOCK_WIKI_USER").unwrap_or_else(|_| "username".to_string());
    let password = std::env::var("MOCK_WIKI_PASSWORD").unwrap_or_else(|_| "password".to_string());
    let addr = format!("127.0.0.1:{port}");

    let wiki = MockWiki::new().with_user(&user, &password);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(%addr, login_token = %wiki.login_token(), "mock wiki listening on /api.php");
    mock_wiki::run(listener, wiki).await
}
