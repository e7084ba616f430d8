//! PostgREST-style client for the hosted database (`/rest/v1/<table>`).

use super::realtime::RealtimeClient;
use super::{ConversationStore, MessageStore, StoreError, Subscription};
use crate::model::{Conversation, Message, NewMessage};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde_json::json;

/// Connection settings for [`RestStore`].
#[derive(Debug, Clone)]
pub struct RestStoreConfig {
    /// Project base URL, e.g. `https://xyz.supabase.co`.
    pub url: String,
    pub api_key: String,
    pub messages_table: String,
    pub conversations_table: String,
}

#[derive(Clone)]
pub struct RestStore {
    base_url: String,
    api_key: String,
    messages_table: String,
    conversations_table: String,
    client: reqwest::Client,
    realtime: RealtimeClient,
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl RestStore {
    pub fn new(config: RestStoreConfig) -> Self {
        let base_url = config.url.trim().trim_end_matches('/').to_string();
        let realtime = RealtimeClient::new(&base_url, &config.api_key, &config.messages_table);
        Self {
            base_url,
            api_key: config.api_key,
            messages_table: config.messages_table,
            conversations_table: config.conversations_table,
            client: reqwest::Client::new(),
            realtime,
        }
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    async fn patch_conversation(
        &self,
        filter: &[(&str, String)],
        body: serde_json::Value,
    ) -> Result<(), StoreError> {
        let res = self
            .request(reqwest::Method::PATCH, &self.conversations_table)
            .query(filter)
            .json(&body)
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(StoreError::Api(format!("{} {}", status, body)));
        }
        Ok(())
    }

    fn request(&self, method: reqwest::Method, table: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, self.table_url(table))
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }

    async fn rows<T: DeserializeOwned>(req: reqwest::RequestBuilder) -> Result<Vec<T>, StoreError> {
        let res = req.send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(StoreError::Api(format!("{} {}", status, body)));
        }
        let body = res.text().await?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn single<T: DeserializeOwned>(
        req: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<T, StoreError> {
        Self::rows(req)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::NotFound(what.to_string()))
    }
}

#[async_trait]
impl MessageStore for RestStore {
    async fn insert(&self, message: NewMessage) -> Result<Message, StoreError> {
        let req = self
            .request(reqwest::Method::POST, &self.messages_table)
            .header("Prefer", "return=representation")
            .json(&message);
        Self::single(req, "inserted message").await
    }

    async fn list(&self, session_id: &str) -> Result<Vec<Message>, StoreError> {
        let req = self.request(reqwest::Method::GET, &self.messages_table).query(&[
            ("select", "*".to_string()),
            ("session_id", format!("eq.{}", session_id)),
            ("order", "created_at.asc".to_string()),
        ]);
        Self::rows(req).await
    }

    async fn reply_after(
        &self,
        session_id: &str,
        since: DateTime<Utc>,
        exclude: &[String],
    ) -> Result<Option<Message>, StoreError> {
        let mut query = vec![
            ("select", "*".to_string()),
            ("session_id", format!("eq.{}", session_id)),
            ("role", "eq.assistant".to_string()),
            ("created_at", format!("gte.{}", timestamp(since))),
            ("order", "created_at.asc".to_string()),
            ("limit", "1".to_string()),
        ];
        if !exclude.is_empty() {
            query.push(("id", format!("not.in.({})", exclude.join(","))));
        }
        let req = self
            .request(reqwest::Method::GET, &self.messages_table)
            .query(&query);
        let rows: Vec<Message> = Self::rows(req).await?;
        Ok(rows.into_iter().next())
    }

    async fn update_content(&self, id: &str, content: &str) -> Result<Message, StoreError> {
        let req = self
            .request(reqwest::Method::PATCH, &self.messages_table)
            .query(&[("id", format!("eq.{}", id))])
            .header("Prefer", "return=representation")
            .json(&json!({ "content": content }));
        Self::single(req, &format!("message {}", id)).await
    }

    async fn subscribe(&self, session_id: &str) -> Result<Subscription, StoreError> {
        self.realtime.subscribe(session_id).await
    }
}

#[async_trait]
impl ConversationStore for RestStore {
    async fn list(&self) -> Result<Vec<Conversation>, StoreError> {
        let req = self
            .request(reqwest::Method::GET, &self.conversations_table)
            .query(&[("select", "*"), ("order", "updated_at.desc")]);
        Self::rows(req).await
    }

    async fn get(&self, id: &str) -> Result<Conversation, StoreError> {
        let req = self
            .request(reqwest::Method::GET, &self.conversations_table)
            .query(&[("select", "*".to_string()), ("id", format!("eq.{}", id))]);
        Self::single(req, &format!("conversation {}", id)).await
    }

    async fn create(&self, title: &str) -> Result<Conversation, StoreError> {
        let req = self
            .request(reqwest::Method::POST, &self.conversations_table)
            .header("Prefer", "return=representation")
            .json(&json!({ "title": title }));
        Self::single(req, "inserted conversation").await
    }

    async fn update(&self, conversation: &Conversation) -> Result<(), StoreError> {
        let id = format!("eq.{}", conversation.id);
        self.patch_conversation(&[("id", id.clone())], json!({ "title": conversation.title }))
            .await?;
        // A row that is already newer matches nothing, so updated_at never moves backwards.
        let at = timestamp(conversation.updated_at);
        self.patch_conversation(
            &[("id", id), ("updated_at", format!("lt.{}", at))],
            json!({ "updated_at": at }),
        )
        .await
    }
}
