use std::{future::pending, time::Duration};

use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{sleep_until, Instant},
};

use crate::connection::ConnectionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BannerText {
    Online,
    Offline,
}

impl BannerText {
    pub fn as_str(&self) -> &'static str {
        match self {
            BannerText::Online => "You are online",
            BannerText::Offline => "You are offline",
        }
    }
}

/// Transient online/offline notice. Shown on every online/offline flip and
/// hidden again after a fixed duration, whatever the connection does next.
pub struct StatusBanner {
    text: watch::Receiver<Option<BannerText>>,
    task: JoinHandle<()>,
}

impl StatusBanner {
    pub fn spawn(mut state: watch::Receiver<ConnectionState>, duration: Duration) -> Self {
        let (text_tx, text_rx) = watch::channel(None);
        let task = tokio::spawn(async move {
            let mut shown_online: Option<bool> = None;
            let mut hide_at: Option<Instant> = None;
            loop {
                let online = state.borrow_and_update().is_connected();
                if shown_online != Some(online) {
                    shown_online = Some(online);
                    let text = if online {
                        BannerText::Online
                    } else {
                        BannerText::Offline
                    };
                    text_tx.send_replace(Some(text));
                    hide_at = Some(Instant::now() + duration);
                }

                tokio::select! {
                    changed = state.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = async {
                        match hide_at {
                            Some(deadline) => sleep_until(deadline).await,
                            None => pending::<()>().await,
                        }
                    } => {
                        text_tx.send_replace(None);
                        hide_at = None;
                    }
                }
            }
        });

        Self {
            text: text_rx,
            task,
        }
    }

    pub fn current(&self) -> Option<BannerText> {
        *self.text.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<BannerText>> {
        self.text.clone()
    }
}

impl Drop for StatusBanner {
    fn drop(&mut self) {
        self.task.abort();
    }
}
