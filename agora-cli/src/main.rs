//! agora: terminal client for the agora forum and chat services.
//!
//! All session handling lives in the SDK; this binary only parses
//! arguments, formats output, and wires stdin into the chat stream.
//!
//!   agora register <username> <email>     - create an account
//!   agora login <email>                    - sign in (password via AGORA_PASSWORD or --password)
//!   agora me                               - show the signed-in account
//!   agora posts / post / new-post / reply  - browse and write on the forum
//!   agora chat                             - tail the live chat and send messages
//!   agora admin users|stats|...            - admin panel queries

mod config;

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::io::AsyncBufReadExt;

use agora_sdk::types::{NewPost, NewReply, Post};
use agora_sdk::{
    ApiClient, ChatConnection, CredentialStore, Identity, ServiceUrls, StreamConfig, StreamEvent,
};

use config::{Config, Resolved};

#[derive(Parser)]
#[command(name = "agora", about = "Terminal client for the agora forum and chat")]
pub struct Cli {
    /// Auth service base URL.
    #[arg(long, env = "AGORA_AUTH_URL")]
    pub auth_url: Option<String>,

    /// Forum service base URL.
    #[arg(long, env = "AGORA_FORUM_URL")]
    pub forum_url: Option<String>,

    /// Chat service base URL (message history).
    #[arg(long, env = "AGORA_CHAT_URL")]
    pub chat_url: Option<String>,

    /// Chat WebSocket endpoint.
    #[arg(long, env = "AGORA_WS_URL")]
    pub ws_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create an account and sign in.
    Register {
        username: String,
        email: String,
        #[arg(long, env = "AGORA_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Sign in and persist the session.
    Login {
        email: String,
        #[arg(long, env = "AGORA_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Invalidate the session and forget the stored tokens.
    Logout,
    /// Show the signed-in account.
    Me,
    /// List forum posts.
    Posts,
    /// Show one post with its replies.
    Post { id: i64 },
    /// Create a post.
    NewPost {
        title: String,
        #[arg(long)]
        content: String,
    },
    /// Reply to a post.
    Reply { post_id: i64, content: String },
    /// Forum-wide counters.
    Stats,
    /// Tail the live chat; stdin lines are sent as messages.
    Chat {
        /// How many history messages to show before going live.
        #[arg(long, default_value = "50")]
        history: u32,
    },
    /// Admin panel queries.
    Admin {
        #[command(subcommand)]
        command: AdminCommand,
    },
}

#[derive(Subcommand)]
enum AdminCommand {
    /// List registered users.
    Users,
    /// Grant or revoke admin rights.
    Role {
        user_id: i64,
        #[arg(long)]
        admin: bool,
    },
    /// Delete a user.
    DeleteUser { user_id: i64 },
    /// Account and session counters.
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let file_config = Config::load();
    let resolved = Resolved::merge(&cli, &file_config);

    let store = Arc::new(CredentialStore::persistent(config::session_path()));
    let api = ApiClient::new(
        ServiceUrls {
            auth: resolved.auth_url.clone(),
            forum: resolved.forum_url.clone(),
            chat: resolved.chat_url.clone(),
        },
        Arc::clone(&store),
    );
    api.gateway().on_session_ended(Box::new(|| {
        eprintln!("Session expired; run `agora login` to sign in again.");
    }));

    match cli.command {
        Command::Register {
            username,
            email,
            password,
        } => {
            api.sign_up(&username, &email, &password).await?;
            println!("Registered and signed in as {username}.");
        }
        Command::Login { email, password } => {
            api.sign_in(&email, &password).await?;
            let user = api.me().await?;
            println!("Signed in as {} <{}>.", user.username, user.email);
        }
        Command::Logout => {
            api.logout().await?;
            println!("Signed out.");
        }
        Command::Me => {
            let user = api.me().await?;
            let role = if user.is_admin { "admin" } else { "member" };
            println!("#{} {} <{}> ({role})", user.id, user.username, user.email);
        }
        Command::Posts => {
            for post in api.posts().await? {
                print_post_line(&post);
            }
        }
        Command::Post { id } => {
            let post = api.post(id).await?;
            print_post_line(&post);
            println!("{}", post.content);
            let replies = api.replies(id).await?;
            if !replies.is_empty() {
                println!("--- {} replies ---", replies.len());
            }
            for reply in replies {
                let author = reply
                    .author
                    .map(|a| a.username)
                    .unwrap_or_else(|| format!("user {}", reply.author_id));
                println!("[{}] {}: {}", reply.created_at.format("%Y-%m-%d %H:%M"), author, reply.content);
            }
        }
        Command::NewPost { title, content } => {
            let post = api.create_post(&NewPost { title, content }).await?;
            println!("Created post #{}.", post.id);
        }
        Command::Reply { post_id, content } => {
            let reply = api.create_reply(post_id, &NewReply { content }).await?;
            println!("Created reply #{} on post #{}.", reply.id, post_id);
        }
        Command::Stats => {
            let stats = api.forum_stats().await?;
            println!(
                "posts: {}  replies: {}  active threads: {}  users posted: {}",
                stats.total_posts, stats.total_replies, stats.active_threads, stats.users_posted
            );
        }
        Command::Chat { history } => {
            run_chat(&api, &resolved.ws_url, history).await?;
        }
        Command::Admin { command } => match command {
            AdminCommand::Users => {
                for user in api.admin_users().await? {
                    let role = if user.is_admin { "admin" } else { "member" };
                    println!("#{} {} <{}> ({role})", user.id, user.username, user.email);
                }
            }
            AdminCommand::Role { user_id, admin } => {
                api.set_user_role(user_id, admin).await?;
                println!(
                    "User #{user_id} is now {}.",
                    if admin { "an admin" } else { "a member" }
                );
            }
            AdminCommand::DeleteUser { user_id } => {
                api.delete_user(user_id).await?;
                println!("User #{user_id} deleted.");
            }
            AdminCommand::Stats => {
                let stats = api.admin_stats().await?;
                println!(
                    "users: {}  active: {}  sessions: {}",
                    stats.total_users, stats.active_users, stats.total_sessions
                );
            }
        },
    }

    Ok(())
}

fn print_post_line(post: &Post) {
    let author = post
        .author
        .as_ref()
        .map(|a| a.username.clone())
        .unwrap_or_else(|| format!("user {}", post.author_id));
    println!(
        "#{} [{}] {} by {}",
        post.id,
        post.created_at.format("%Y-%m-%d %H:%M"),
        post.title,
        author
    );
}

async fn run_chat(api: &ApiClient, ws_url: &str, history: u32) -> Result<()> {
    match api.chat_history(history, None).await {
        Ok(messages) => {
            for msg in messages {
                print_chat_message(&msg.username, &msg.content, msg.created_at);
            }
        }
        Err(e) => eprintln!("Warning: can't load history: {e}"),
    }

    // Identity stamps outbound messages; anonymous chat is still allowed.
    let identity = match api.me().await {
        Ok(user) => Some(Identity {
            user_id: user.id,
            username: user.username,
        }),
        Err(_) => None,
    };

    let chat = ChatConnection::new(
        StreamConfig {
            url: ws_url.to_string(),
            identity,
            ..StreamConfig::default()
        },
        Arc::clone(api.store()),
    );
    let Some(mut events) = chat.connect() else {
        anyhow::bail!("chat connection already active");
    };

    println!("* connecting to {ws_url} (Ctrl-D to quit)");
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut temp_seq: u64 = 0;
    let mut stdin_open = true;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(StreamEvent::Open) => println!("* connected"),
                Some(StreamEvent::Message(msg)) => {
                    print_chat_message(&msg.username, &msg.content, msg.created_at);
                }
                Some(StreamEvent::Reconnecting { attempt, delay }) => {
                    println!("* connection lost, retrying in {}s (attempt {attempt})", delay.as_secs());
                }
                Some(StreamEvent::SessionExpired { reason }) => {
                    println!("* session expired: {reason}; run `agora login`");
                    break;
                }
                Some(StreamEvent::Closed { reason }) => {
                    match reason {
                        Some(reason) => println!("* disconnected: {reason}"),
                        None => println!("* disconnected"),
                    }
                    break;
                }
                None => break,
            },
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) => {
                    let text = line.trim();
                    if text.is_empty() {
                        continue;
                    }
                    temp_seq += 1;
                    if let Err(e) = chat.send(text, &format!("cli-{temp_seq}")).await {
                        println!("* message not sent ({e})");
                    }
                }
                None => {
                    stdin_open = false;
                    chat.disconnect();
                }
            },
        }
    }

    Ok(())
}

fn print_chat_message(username: &str, content: &str, at: Option<chrono::DateTime<chrono::Utc>>) {
    let when = at
        .map(|t| t.with_timezone(&chrono::Local).format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "--:--:--".to_string());
    let who = if username.is_empty() { "?" } else { username };
    println!("[{when}] <{who}> {content}");
}
