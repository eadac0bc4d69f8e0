use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use reqwest::Client;
use serde::Deserialize;
use shared::{
    domain::{EmailAddress, LanguageCode},
    protocol::Message,
};
use tracing::warn;

use crate::error::TranslationError;

pub const TRANSLATION_FAILED: &str = "Translation failed";

#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate_text(
        &self,
        text: &str,
        target: &LanguageCode,
    ) -> Result<String, TranslationError>;
}

pub struct MissingTranslator;

#[async_trait]
impl Translator for MissingTranslator {
    async fn translate_text(
        &self,
        _text: &str,
        target: &LanguageCode,
    ) -> Result<String, TranslationError> {
        Err(TranslationError::Unavailable(format!(
            "no translator configured for {target}"
        )))
    }
}

#[derive(Debug, Deserialize)]
struct TranslateResponse {
    translated_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Language {
    pub code: LanguageCode,
    pub name: String,
}

/// Client for the translation service (`/translate`, `/languages`).
pub struct HttpTranslator {
    http: Client,
    base_url: String,
}

impl HttpTranslator {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub async fn languages(&self) -> Result<Vec<Language>, TranslationError> {
        let languages = self
            .http
            .get(format!("{}/languages", self.base_url))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(languages)
    }
}

#[async_trait]
impl Translator for HttpTranslator {
    async fn translate_text(
        &self,
        text: &str,
        target: &LanguageCode,
    ) -> Result<String, TranslationError> {
        let body: TranslateResponse = self
            .http
            .get(format!("{}/translate", self.base_url))
            .query(&[("reciver_lang", target.as_str()), ("message", text)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        body.translated_message
            .filter(|text| !text.is_empty())
            .ok_or(TranslationError::EmptyResponse)
    }
}

/// Best-effort translated rendering of inbound messages for one viewer.
#[derive(Clone)]
pub struct TranslationOverlay {
    translator: Arc<dyn Translator>,
    viewer: EmailAddress,
    target: LanguageCode,
}

impl TranslationOverlay {
    pub fn new(translator: Arc<dyn Translator>, viewer: EmailAddress, target: LanguageCode) -> Self {
        Self {
            translator,
            viewer,
            target,
        }
    }

    pub fn viewer(&self) -> &EmailAddress {
        &self.viewer
    }

    pub fn target(&self) -> &LanguageCode {
        &self.target
    }

    pub async fn translate(&self, message: Message) -> Message {
        self.translate_to(message, &self.target).await
    }

    /// Never fails: self-authored and already-translated messages pass
    /// through untouched, and a failed call yields the sentinel text.
    pub async fn translate_to(&self, message: Message, target: &LanguageCode) -> Message {
        if message.sender_email == self.viewer || message.translated_text.is_some() {
            return message;
        }

        match self.translator.translate_text(&message.text, target).await {
            Ok(translated) => message.with_translation(translated),
            Err(err) => {
                warn!(
                    conversation_id = %message.conversation_id,
                    sender = %message.sender_email,
                    "translation: failed: {err}"
                );
                message.with_translation(TRANSLATION_FAILED)
            }
        }
    }

    /// Translates concurrently; output order always matches input order.
    pub async fn translate_batch(&self, messages: Vec<Message>) -> Vec<Message> {
        join_all(messages.into_iter().map(|message| self.translate(message))).await
    }
}

#[cfg(test)]
#[path = "tests/translation_tests.rs"]
mod tests;
