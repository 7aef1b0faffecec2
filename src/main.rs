//! Terminal client for the shared chat room.
//!
//! Wires the library against a live backend from environment configuration:
//! restore or sign in a session, print recent history, then mirror the live
//! message and typing feeds to the terminal while stdin lines are sent as
//! messages.

use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, BufReader};

use recetario::backend::AuthToken;
use recetario::backend::config::BackendConfig;
use recetario::backend::realtime::RealtimeFeed;
use recetario::backend::rest::RestClient;
use recetario::prefs::FileFlagStore;
use recetario::services::auth::AuthClient;
use recetario::services::chat::{ChatMessage, MessageLog, MessageRelay};
use recetario::services::recipes::RecipeService;
use recetario::services::typing::{TypingEmitter, watch_typing};

fn print_message(message: &ChatMessage) {
    println!(
        "[{:02}:{:02}] {}: {}",
        message.created_at.hour(),
        message.created_at.minute(),
        message.author.email,
        message.content
    );
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let config = BackendConfig::from_env().expect("backend configuration");
    let token = AuthToken::default();
    let rest = Arc::new(RestClient::new(&config, token.clone()));
    let feed = Arc::new(RealtimeFeed::new(config.realtime_url(), config.feed));
    let prefs_path = std::env::var("RECETARIO_PREFS").unwrap_or_else(|_| ".recetario.json".into());
    let flags = Arc::new(FileFlagStore::open(prefs_path));

    let auth = AuthClient::new(rest.clone(), rest.clone(), flags, token);

    // Remembered session, or credentials from the environment.
    let session = match auth.restore() {
        Some(session) => session,
        None => {
            let email = std::env::var("RECETARIO_EMAIL").expect("RECETARIO_EMAIL required");
            let password = std::env::var("RECETARIO_PASSWORD").expect("RECETARIO_PASSWORD required");
            auth.sign_in(&email, &password, true)
                .await
                .expect("sign in failed")
        }
    };
    println!("conectado como {} ({})", session.email, session.rol);

    let relay = MessageRelay::new(rest.clone(), feed.clone(), auth.session());
    let recipes = RecipeService::new(rest.clone(), rest.clone(), &config.storage_bucket, auth.session());
    let mut emitter = TypingEmitter::new(rest.clone(), session.user_id);

    let log = Arc::new(Mutex::new(MessageLog::new()));
    match relay.fetch_recent(50).await {
        Ok(history) => {
            for message in &history {
                print_message(message);
            }
            log.lock().unwrap().replace_history(history);
        }
        Err(e) => eprintln!("no se pudo cargar el historial: {e}"),
    }

    // Live messages; the log ignores echoes of rows already in history.
    let log_for_watch = Arc::clone(&log);
    let mut message_watch = relay
        .watch(move |message| {
            let mut log = log_for_watch.lock().unwrap();
            if log.insert_unique(message.clone()) {
                print_message(&message);
            }
        })
        .await
        .expect("message subscription");

    let mut typing_watch = watch_typing(feed.as_ref(), |users| {
        if users.is_empty() {
            println!("(nadie está escribiendo)");
        } else {
            println!("({} escribiendo…)", users.len());
        }
    })
    .await
    .expect("typing subscription");

    println!("comandos: /recetas, /buscar <texto>, /borrar <id>, /salir");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim().to_string();
        if line == "/salir" {
            break;
        } else if line == "/recetas" {
            match recipes.list().await {
                Ok(list) => {
                    for recipe in list {
                        println!("- {} ({})", recipe.name, recipe.id);
                    }
                }
                Err(e) => eprintln!("error: {e}"),
            }
        } else if let Some(term) = line.strip_prefix("/buscar ") {
            match recipes.search(term).await {
                Ok(list) => {
                    for recipe in list {
                        println!("- {} ({})", recipe.name, recipe.id);
                    }
                }
                Err(e) => eprintln!("error: {e}"),
            }
        } else if let Some(raw_id) = line.strip_prefix("/borrar ") {
            match raw_id.parse() {
                Ok(id) => match relay.delete(id).await {
                    Ok(()) => log.lock().unwrap().remove(id),
                    Err(e) => eprintln!("error: {e}"),
                },
                Err(_) => eprintln!("id inválido: {raw_id}"),
            }
        } else if line.is_empty() {
            emitter.keystroke("");
        } else {
            // Line-based stand-in for per-character input: one typing
            // signal per submitted line.
            emitter.keystroke(&line);
            match relay.send(&line).await {
                Ok(()) => emitter.submitted(),
                Err(e) => eprintln!("error: {e}"),
            }
        }
    }

    message_watch.unsubscribe().await;
    typing_watch.unsubscribe().await;
    println!("hasta luego");
}
