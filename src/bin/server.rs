use std::net::SocketAddr;
use std::sync::Arc;

use gauntlet::{HttpStatusClient, Problem, ProblemCatalog, SessionManager, SqliteStore};

#[tokio::main]
async fn main() {
    let db_path = std::env::var("GAUNTLET_DB").unwrap_or_else(|_| "gauntlet.db".to_string());
    let judge_url = std::env::var("GAUNTLET_JUDGE_URL")
        .unwrap_or_else(|_| "https://codeforces.com/api".to_string());

    let store = Arc::new(SqliteStore::open(&db_path).unwrap());
    let catalog = match std::env::var("GAUNTLET_PROBLEMS") {
        Ok(path) => {
            let json = std::fs::read_to_string(&path).unwrap();
            let problems: Vec<Problem> = serde_json::from_str(&json).unwrap();
            println!("Loaded {} problem(s) from {}", problems.len(), path);
            Arc::new(ProblemCatalog::from_problems(problems))
        }
        Err(_) => Arc::new(ProblemCatalog::new()),
    };
    let judge = Arc::new(HttpStatusClient::new(judge_url));
    let manager = SessionManager::new(store.clone(), store, judge, catalog);

    let app = gauntlet::server::router(manager);

    let addr = SocketAddr::from(([0, 0, 0, 0], 3000));
    println!("Gauntlet server listening on {}", addr);
    println!("\nAvailable endpoints:");
    println!("  POST /challenges                            - Create a challenge");
    println!("  GET  /challenges                            - List live challenges");
    println!("  GET  /challenges/{{challenge_id}}             - Challenge status");
    println!("  POST /challenges/{{challenge_id}}/actions     - Confirm / retract / give up / withdraw");
    println!("  GET  /challenges/{{challenge_id}}/events      - Lifecycle events (SSE)");

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
