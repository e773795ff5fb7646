//! REST client for the history and membership endpoints the sync core needs.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use shared::{
    domain::{ChannelId, Conversation, ConversationId, MemberId, ProfileId, Server, ServerId},
    error::{ApiErrorBody, ApiException},
    protocol::{ApiEnvelope, DirectMessagePage, MessagePage},
};
use tracing::debug;
use url::Url;

use crate::{connector::CredentialProvider, error::ApiFailure};

#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn channel_messages(
        &self,
        channel_id: ChannelId,
        page: u32,
        page_size: u32,
    ) -> Result<MessagePage, ApiFailure>;

    async fn conversation_messages(
        &self,
        conversation_id: ConversationId,
        page: u32,
        page_size: u32,
    ) -> Result<DirectMessagePage, ApiFailure>;

    /// Returns the conversation between the two members, creating it on the
    /// backend when it does not exist yet.
    async fn conversation_by_members(
        &self,
        member_one_id: MemberId,
        member_two_id: MemberId,
        direct_message_limit: u32,
    ) -> Result<Conversation, ApiFailure>;

    async fn servers_for_profile(&self, profile_id: ProfileId) -> Result<Vec<Server>, ApiFailure>;

    async fn server_details(&self, server_id: ServerId) -> Result<Server, ApiFailure>;
}

pub struct ApiClient {
    http: Client,
    base_url: Url,
    credentials: Arc<dyn CredentialProvider>,
}

impl ApiClient {
    pub fn new(base_url: Url, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            http: Client::new(),
            base_url,
            credentials,
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiFailure> {
        let raw = format!(
            "{}/{}",
            self.base_url.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        Ok(Url::parse(&raw)?)
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ApiFailure> {
        let url = self.endpoint(path)?;
        let mut request = self.http.get(url.clone()).query(query);
        if let Some(token) = self.credentials.bearer_token().await {
            request = request.bearer_auth(token);
        }

        let http_failure = |source| ApiFailure::Http {
            url: url.to_string(),
            source,
        };
        let response = request.send().await.map_err(http_failure)?;
        let status = response.status();
        let body = response.text().await.map_err(http_failure)?;
        debug!(%url, status = status.as_u16(), "api response");

        if !status.is_success() {
            let error: ApiErrorBody = serde_json::from_str(&body).unwrap_or_default();
            return Err(ApiException::from_body(status.as_u16(), error).into());
        }

        let envelope: ApiEnvelope<T> =
            serde_json::from_str(&body).map_err(|source| ApiFailure::Decode {
                url: url.to_string(),
                source,
            })?;
        Ok(envelope.result)
    }
}

#[async_trait]
impl ChatApi for ApiClient {
    async fn channel_messages(
        &self,
        channel_id: ChannelId,
        page: u32,
        page_size: u32,
    ) -> Result<MessagePage, ApiFailure> {
        self.get(
            &format!("messages/channel/{channel_id}"),
            &[("page", page.to_string()), ("pageSize", page_size.to_string())],
        )
        .await
    }

    async fn conversation_messages(
        &self,
        conversation_id: ConversationId,
        page: u32,
        page_size: u32,
    ) -> Result<DirectMessagePage, ApiFailure> {
        self.get(
            &format!("directMessages/by-conversation/{conversation_id}"),
            &[("page", page.to_string()), ("pageSize", page_size.to_string())],
        )
        .await
    }

    async fn conversation_by_members(
        &self,
        member_one_id: MemberId,
        member_two_id: MemberId,
        direct_message_limit: u32,
    ) -> Result<Conversation, ApiFailure> {
        self.get(
            "conversations/by-members",
            &[
                ("memberOneId", member_one_id.to_string()),
                ("memberTwoId", member_two_id.to_string()),
                ("directMessageLimit", direct_message_limit.to_string()),
            ],
        )
        .await
    }

    async fn servers_for_profile(&self, profile_id: ProfileId) -> Result<Vec<Server>, ApiFailure> {
        self.get(&format!("servers/member/profile/{profile_id}"), &[])
            .await
    }

    async fn server_details(&self, server_id: ServerId) -> Result<Server, ApiFailure> {
        self.get(&format!("servers/details/{server_id}"), &[]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{connector::StaticCredential, test_support::message};
    use axum::{
        extract::{Path, Query},
        http::{HeaderMap, StatusCode},
        routing::get,
        Json, Router,
    };
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use tokio::net::TcpListener;

    async fn channel_page(
        Path(channel_id): Path<String>,
        Query(query): Query<HashMap<String, String>>,
        headers: HeaderMap,
    ) -> (StatusCode, Json<Value>) {
        let authorized = headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            == Some("Bearer secret");
        if !authorized {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"message": "No token", "statusCode": 401})),
            );
        }
        let channel_id: ChannelId = channel_id.parse().expect("channel id");
        let page: u32 = query["page"].parse().expect("page");
        let page_size: u32 = query["pageSize"].parse().expect("page size");
        let messages = vec![message(channel_id, 1, "hello")];
        (
            StatusCode::OK,
            Json(json!({
                "message": "ok",
                "result": {
                    "messages": messages,
                    "page": page,
                    "pageSize": page_size,
                    "totalCount": 1
                }
            })),
        )
    }

    async fn missing_server() -> (StatusCode, Json<Value>) {
        (
            StatusCode::NOT_FOUND,
            Json(json!({"message": "Server not found", "statusCode": 404})),
        )
    }

    async fn spawn_api() -> String {
        std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let app = Router::new()
            .route("/api/messages/channel/:channel_id", get(channel_page))
            .route("/api/servers/details/:server_id", get(missing_server));
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}/api")
    }

    fn client(base: &str, credentials: StaticCredential) -> ApiClient {
        ApiClient::new(Url::parse(base).expect("base url"), Arc::new(credentials))
    }

    #[tokio::test]
    async fn unwraps_the_result_envelope_and_sends_the_bearer() {
        let base = spawn_api().await;
        let channel_id = ChannelId::random();
        let page = client(&base, StaticCredential::new("secret"))
            .channel_messages(channel_id, 2, 15)
            .await
            .expect("page");
        assert_eq!(page.page, 2);
        assert_eq!(page.page_size, 15);
        assert_eq!(page.messages.len(), 1);
        assert_eq!(page.messages[0].channel_id, channel_id);
    }

    #[tokio::test]
    async fn error_bodies_become_api_exceptions() {
        let base = spawn_api().await;
        let err = client(&base, StaticCredential::anonymous())
            .channel_messages(ChannelId::random(), 1, 15)
            .await
            .expect_err("unauthorized");
        let ApiFailure::Api(exception) = err else {
            panic!("expected api exception, got {err:?}");
        };
        assert_eq!(exception.status, 401);
        assert_eq!(exception.message, "No token");

        let err = client(&base, StaticCredential::new("secret"))
            .server_details(ServerId::random())
            .await
            .expect_err("missing");
        assert!(matches!(
            err,
            ApiFailure::Api(ApiException {
                code: shared::error::ErrorCode::NotFound,
                ..
            })
        ));
    }
}
