//! # Terminal Chat Example
//!
//! A line-oriented chat client on top of [`ChatClient`]:
//!
//! 1. Start a session against a running chat service (the session cookie is
//!    expected to come from the service's own sign-in flow)
//! 2. Print the room list whenever it changes
//! 3. Read commands from stdin to open rooms, send messages and create rooms
//! 4. Shut down gracefully on `/quit`, Ctrl+C, or session end
//!
//! ## Running
//!
//! ```sh
//! cargo run --example terminal_chat
//!
//! # Override the service URLs:
//! CHAT_API_URL=http://my-host:4000 CHAT_WS_URL=ws://my-host:4000 \
//!     cargo run --example terminal_chat
//! ```
//!
//! ## Commands
//!
//! | Input           | Effect                              |
//! |-----------------|-------------------------------------|
//! | `/rooms`        | refetch and print the room list     |
//! | `/open <id>`    | open a room                         |
//! | `/close`        | leave the open room                 |
//! | `/new <userId>` | create a room with another user     |
//! | `/logout`       | end the session                     |
//! | `/resume`       | start a new session                 |
//! | `/quit`         | exit                                |
//! | anything else   | send to the open room               |

use chat_sync_client::{ChatClient, ChatConfig, ChatEvent, SenderId, SyncSnapshot};
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ── Logging ─────────────────────────────────────────────────────
    // Set `RUST_LOG=chat_sync_client=debug` for verbose output.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    // ── Start ───────────────────────────────────────────────────────
    let config = ChatConfig::from_env().with_session_observer(|reason| {
        tracing::warn!("session ended: {reason:?}");
    });
    tracing::info!("Connecting to {}", config.api_base_url);
    let (mut client, mut events) = ChatClient::connect(config)?;
    let mut state = client.subscribe();
    let mut printed = PrintedState::default();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            // Branch 1: discrete events from the core.
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };
                match event {
                    ChatEvent::ServerError { message } => println!("! server: {message}"),
                    ChatEvent::RequestFailed { operation, error } => {
                        println!("! {operation:?} failed: {error}");
                    }
                    ChatEvent::SessionEnded { reason } => {
                        println!("* session ended ({reason:?}); /resume or /quit");
                    }
                    other => tracing::debug!("event: {other:?}"),
                }
            }

            // Branch 2: state changed; print what is new.
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = state.borrow_and_update().clone();
                printed.show(&snapshot);
            }

            // Branch 3: a line from the user.
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                if !handle_line(&client, line.trim()).await {
                    break;
                }
            }

            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl+C received, shutting down");
                break;
            }
        }
    }

    client.shutdown().await;
    Ok(())
}

/// Run one input line. Returns `false` to quit.
async fn handle_line(client: &ChatClient, line: &str) -> bool {
    let (command, arg) = line.split_once(' ').unwrap_or((line, ""));
    let result = match command {
        "" => Ok(()),
        "/quit" => return false,
        "/rooms" => client.refresh_rooms(),
        "/open" => client.open_room(arg.trim()),
        "/close" => client.close_room(),
        "/logout" => client.logout(),
        "/resume" => client.resume_session(),
        "/new" => match arg.trim().parse() {
            Ok(user_id) => client
                .create_room(user_id)
                .await
                .map(|room| println!("* created room {}", room.id)),
            Err(_) => {
                println!("usage: /new <userId>");
                Ok(())
            }
        },
        _ => client.send_message(line).await.map(|_| ()),
    };
    if let Err(e) = result {
        println!("! {e}");
    }
    true
}

/// Tracks what was already printed so each change is shown once.
#[derive(Default)]
struct PrintedState {
    room_order: Vec<String>,
    active_room: Option<String>,
    messages: usize,
}

impl PrintedState {
    fn show(&mut self, snapshot: &SyncSnapshot) {
        let order: Vec<String> = snapshot.rooms.iter().map(|r| r.id.clone()).collect();
        if order != self.room_order {
            println!("* rooms:");
            for room in &snapshot.rooms {
                let preview = room
                    .messages
                    .last()
                    .map_or("", |message| message.content.as_str());
                println!("    {}  {}", room.id, preview);
            }
            self.room_order = order;
        }

        if snapshot.active_room != self.active_room {
            if let Some(room_id) = &snapshot.active_room {
                println!("* opened {room_id}");
            }
            self.active_room = snapshot.active_room.clone();
            self.messages = 0;
        }

        for message in snapshot.messages.iter().skip(self.messages) {
            let who = match message.sender_id {
                SenderId::User(id) => id.to_string(),
                SenderId::Local => "me".to_string(),
            };
            let pending = if message.is_optimistic() { " (sending)" } else { "" };
            println!(
                "[{}] {who}: {}{pending}",
                message.created_at.format("%H:%M"),
                message.content
            );
        }
        self.messages = snapshot.messages.len();
    }
}
