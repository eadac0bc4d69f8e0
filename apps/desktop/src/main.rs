use std::{path::PathBuf, time::Duration};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use client_core::{
    config::load_settings_strict,
    load_settings,
    roster::{GroupRoster, PrivateRoster, RosterKind, RosterSnapshot},
    BackingIdentity, BannerText, ChatClient, ConnectionHandle, ConversationSession,
    ConversationStatus, ConversationTarget, HttpTranslator, RosterView,
};
use shared::{
    domain::{ConversationId, ConversationKind},
    protocol::{GroupConversation, Message, PrivateConversation},
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::watch,
    time::timeout,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// Settings file; defaults to ./client.toml when present.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    email: Option<String>,
    /// Identity provider uid; defaults to the email.
    #[arg(long)]
    uid: Option<String>,
    /// Open the private conversation with this id.
    #[arg(long, conflicts_with = "group")]
    chat: Option<String>,
    /// Open the group conversation with this id.
    #[arg(long)]
    group: Option<String>,
    #[arg(long)]
    create_chat: Option<String>,
    #[arg(long, requires = "members")]
    create_group: Option<String>,
    #[arg(long, value_delimiter = ',')]
    members: Vec<String>,
    #[arg(long)]
    list_languages: bool,
}

const ROSTER_WAIT: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut settings = match &args.config {
        Some(path) => load_settings_strict(path)?,
        None => load_settings(),
    };
    if let Some(server_url) = &args.server_url {
        settings.server_url = server_url.clone();
        settings.connection.server_url = server_url.clone();
    }

    if args.list_languages {
        let languages = HttpTranslator::new(settings.translation_url.clone())
            .languages()
            .await
            .context("failed to fetch supported languages")?;
        for language in languages {
            println!("{}\t{}", language.code, language.name);
        }
        return Ok(());
    }

    let email = args
        .email
        .clone()
        .context("--email is required unless --list-languages is given")?;
    let client = ChatClient::new(settings);
    let session = client
        .sign_in(Some(BackingIdentity {
            uid: args.uid.clone().unwrap_or_else(|| email.clone()),
            email,
        }))
        .await
        .context("sign-in failed")?
        .context("identity exchange returned no session")?;
    info!(email = %session.email, language = %session.preferred_language, "desktop: signed in");

    let handle = wait_for_connection(&client).await?;
    let banner = client.status_banner(&handle);
    let banner_task = tokio::spawn(print_banner(banner.subscribe()));

    let private = client.private_roster().context("signed out during startup")?;
    let groups = client.group_roster().context("signed out during startup")?;
    let private_chats = wait_for_roster(&private).await;
    let group_chats = wait_for_roster(&groups).await;
    print_private_roster(&private_chats);
    print_group_roster(&group_chats);

    if let Some(receiver) = &args.create_chat {
        let creator = client.creator().context("signed out during startup")?;
        match creator.create_private_chat(receiver).await {
            Ok(chat) => println!("created chat {} with {}", chat.id, chat.counterpart_email),
            Err(err) => println!("could not create chat: {err}"),
        }
    }
    if let Some(name) = &args.create_group {
        let creator = client.creator().context("signed out during startup")?;
        let members: Vec<&str> = args.members.iter().map(String::as_str).collect();
        match creator.create_group_chat(name, &members).await {
            Ok(group) => println!("created group {} ({})", group.group_name, group.id),
            Err(err) => println!("could not create group: {err}"),
        }
    }

    let target = match (&args.chat, &args.group) {
        (Some(id), _) => Some(private_target(&private, id)?),
        (None, Some(id)) => Some(group_target(&groups, id)?),
        (None, None) => None,
    };
    if let Some(target) = target {
        let open = Some(target.id().clone());
        match target.kind() {
            ConversationKind::Private => private.set_open(open),
            ConversationKind::Group => groups.set_open(open),
        }
        let conversation = client
            .open_conversation(target)
            .context("signed out during startup")?;
        match conversation.target().kind() {
            ConversationKind::Private => conversation.mark_read(&private),
            ConversationKind::Group => conversation.mark_read(&groups),
        }
        run_conversation(&conversation, &handle).await?;
        conversation.unmount().await;
    } else {
        println!("no conversation selected; press ctrl-c to exit");
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for ctrl-c")?;
    }

    banner_task.abort();
    private.unmount().await;
    groups.unmount().await;
    client.shutdown().await;
    Ok(())
}

async fn wait_for_connection(client: &ChatClient) -> Result<ConnectionHandle> {
    let mut handles = client.connections();
    let handle = timeout(Duration::from_secs(5), handles.wait_for(Option::is_some))
        .await
        .context("connection was not opened")?
        .map_err(|_| anyhow!("client stopped before connecting"))?
        .clone();
    handle.context("signed out before connecting")
}

async fn wait_for_roster<K: RosterKind>(view: &RosterView<K>) -> RosterSnapshot<K::Entry> {
    let mut snapshots = view.subscribe();
    let snapshot = match timeout(ROSTER_WAIT, snapshots.wait_for(|snapshot| !snapshot.loading))
        .await
    {
        Ok(Ok(snapshot)) => snapshot.clone(),
        _ => {
            warn!(kind = K::NAME, "desktop: roster not loaded yet");
            view.snapshot()
        }
    };
    snapshot
}

fn print_private_roster(snapshot: &RosterSnapshot<PrivateConversation>) {
    println!("private chats:");
    for chat in &snapshot.entries {
        let presence = if chat.is_online { "online" } else { "offline" };
        println!(
            "  {}  {}  [{}]  unread={}  {}",
            chat.id,
            chat.counterpart_email,
            presence,
            chat.unread_count,
            chat.last_updated_at.to_rfc3339()
        );
    }
}

fn print_group_roster(snapshot: &RosterSnapshot<GroupConversation>) {
    println!("group chats:");
    for group in &snapshot.entries {
        println!(
            "  {}  {}  members={}  unread={}  {}",
            group.id,
            group.group_name,
            group.members.len(),
            group.unread_count,
            group.last_updated_at.to_rfc3339()
        );
    }
}

fn private_target(roster: &RosterView<PrivateRoster>, id: &str) -> Result<ConversationTarget> {
    let id = ConversationId::new(id);
    let chat = roster
        .snapshot()
        .entries
        .into_iter()
        .find(|chat| chat.id == id)
        .with_context(|| format!("no private chat with id {id}"))?;
    Ok(ConversationTarget::Private {
        id,
        counterpart: chat.counterpart_email,
    })
}

fn group_target(roster: &RosterView<GroupRoster>, id: &str) -> Result<ConversationTarget> {
    let id = ConversationId::new(id);
    let group = roster
        .snapshot()
        .entries
        .into_iter()
        .find(|group| group.id == id)
        .with_context(|| format!("no group chat with id {id}"))?;
    Ok(ConversationTarget::Group {
        id,
        name: group.group_name,
    })
}

async fn print_banner(mut banner: watch::Receiver<Option<BannerText>>) {
    loop {
        if let Some(text) = *banner.borrow_and_update() {
            println!("[{}]", text.as_str());
        }
        if banner.changed().await.is_err() {
            break;
        }
    }
}

fn print_message(message: &Message) {
    let time = message
        .sent_at
        .map(|at| at.format("%H:%M").to_string())
        .unwrap_or_else(|| "N/A".to_string());
    match &message.translated_text {
        Some(translated) => println!(
            "{time} {}: {}  ({})",
            message.sender_email, message.text, translated
        ),
        None => println!("{time} {}: {}", message.sender_email, message.text),
    }
}

/// Prints the conversation as it grows and sends every stdin line until EOF
/// or ctrl-c.
async fn run_conversation(
    conversation: &ConversationSession,
    handle: &ConnectionHandle,
) -> Result<()> {
    println!("conversation: {}", conversation.target().title());
    let mut view = conversation.subscribe();
    let mut printed = 0;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        {
            let current = view.borrow_and_update();
            if current.status == ConversationStatus::Ready {
                for message in current.messages.iter().skip(printed) {
                    print_message(message);
                }
                printed = current.messages.len();
            }
        }

        tokio::select! {
            changed = view.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            line = lines.next_line() => {
                let Some(mut draft) = line.context("failed to read stdin")? else {
                    break;
                };
                if let Err(err) = conversation.send(&mut draft) {
                    if handle.is_connected() {
                        println!("not sent: {err}");
                    } else {
                        println!("not sent, you are offline: {err}");
                    }
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for ctrl-c")?;
                break;
            }
        }
    }

    if conversation.view().status == ConversationStatus::Loading {
        warn!("desktop: conversation closed before its history arrived");
    }
    Ok(())
}
