use chrono::{SecondsFormat, TimeZone, Utc};
use opsdesk::model::{NewMessage, Role};
use opsdesk::store::{ConversationStore, MessageStore, RestStore, RestStoreConfig, StoreError};
use serde_json::json;
use wiremock::matchers::{
    body_json, body_partial_json, header, method, path, query_param, query_param_is_missing,
};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn store(server: &MockServer) -> RestStore {
    RestStore::new(RestStoreConfig {
        url: format!("{}/", server.uri()),
        api_key: "anon-key".to_string(),
        messages_table: "chat_messages".to_string(),
        conversations_table: "chat_sessions".to_string(),
    })
}

fn row(id: &str, role: &str, content: &str, created_at: &str) -> serde_json::Value {
    json!({
        "id": id,
        "session_id": "conv-1",
        "role": role,
        "content": content,
        "created_at": created_at,
    })
}

#[tokio::test]
async fn insert_returns_stored_row() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/chat_messages"))
        .and(header("apikey", "anon-key"))
        .and(header("authorization", "Bearer anon-key"))
        .and(header("prefer", "return=representation"))
        .and(body_partial_json(json!({ "session_id": "conv-1", "role": "user", "content": "check do" })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!([row(
            "m-1",
            "user",
            "check do",
            "2024-05-01T08:00:00.123456Z"
        )])))
        .expect(1)
        .mount(&server)
        .await;

    let message = store(&server)
        .insert(NewMessage::user("conv-1", "check do"))
        .await
        .unwrap();
    assert_eq!(message.id, "m-1");
    assert_eq!(message.role, Role::User);
    assert_eq!(message.payload, None);
}

#[tokio::test]
async fn reply_after_filters_by_time_role_and_seen_ids() {
    let server = MockServer::start().await;
    let since = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
    Mock::given(method("GET"))
        .and(path("/rest/v1/chat_messages"))
        .and(query_param("session_id", "eq.conv-1"))
        .and(query_param("role", "eq.assistant"))
        .and(query_param(
            "created_at",
            format!("gte.{}", since.to_rfc3339_opts(SecondsFormat::Micros, true)),
        ))
        .and(query_param("order", "created_at.asc"))
        .and(query_param("limit", "1"))
        .and(query_param("id", "not.in.(m-1,m-2)"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([row(
            "m-3",
            "assistant",
            "| DO | Status |",
            "2024-05-01T08:00:04Z"
        )])))
        .mount(&server)
        .await;

    let reply = store(&server)
        .reply_after("conv-1", since, &["m-1".to_string(), "m-2".to_string()])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.id, "m-3");
    assert_eq!(reply.role, Role::Assistant);
}

#[tokio::test]
async fn reply_after_with_nothing_yet() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/chat_messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    let reply = store(&server)
        .reply_after("conv-1", Utc::now(), &[])
        .await
        .unwrap();
    assert!(reply.is_none());
}

#[tokio::test]
async fn api_errors_carry_status_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/chat_messages"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
        .mount(&server)
        .await;

    let err = MessageStore::list(&store(&server), "conv-1").await.unwrap_err();
    match err {
        StoreError::Api(detail) => {
            assert!(detail.contains("401"), "{}", detail);
            assert!(detail.contains("invalid api key"), "{}", detail);
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn update_content_patches_by_id() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/chat_messages"))
        .and(query_param("id", "eq.m-3"))
        .and(body_partial_json(json!({ "content": "edited" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([row(
            "m-3",
            "assistant",
            "edited",
            "2024-05-01T08:00:04Z"
        )])))
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/chat_messages"))
        .and(query_param("id", "eq.missing"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    let s = store(&server);
    assert_eq!(s.update_content("m-3", "edited").await.unwrap().content, "edited");
    assert!(matches!(
        s.update_content("missing", "edited").await,
        Err(StoreError::NotFound(_))
    ));
}

#[tokio::test]
async fn conversations_round_trip_through_rest() {
    let server = MockServer::start().await;
    let conversation = json!({
        "id": "conv-1",
        "title": "New conversation",
        "created_at": "2024-05-01T08:00:00Z",
        "updated_at": "2024-05-01T08:00:00Z",
    });
    Mock::given(method("POST"))
        .and(path("/rest/v1/chat_sessions"))
        .and(body_partial_json(json!({ "title": "New conversation" })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!([conversation.clone()])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/chat_sessions"))
        .and(query_param("order", "updated_at.desc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([conversation])))
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/chat_sessions"))
        .and(query_param("id", "eq.conv-1"))
        .and(query_param_is_missing("updated_at"))
        .and(body_json(json!({ "title": "check do" })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/chat_sessions"))
        .and(query_param("id", "eq.conv-1"))
        .and(query_param("updated_at", "lt.2024-05-01T09:00:00.000000Z"))
        .and(body_json(json!({ "updated_at": "2024-05-01T09:00:00.000000Z" })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let s = store(&server);
    let mut created = s.create("New conversation").await.unwrap();
    assert!(created.has_default_title());
    assert_eq!(ConversationStore::list(&s).await.unwrap().len(), 1);

    created.title = "check do".to_string();
    created.touch(Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap());
    s.update(&created).await.unwrap();
}

#[tokio::test]
async fn rename_is_saved_when_stored_row_is_newer() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/chat_sessions"))
        .and(query_param_is_missing("updated_at"))
        .and(body_json(json!({ "title": "usd to sgd rate" })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    // Another writer already moved updated_at past ours: the guarded write matches no row.
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/chat_sessions"))
        .and(query_param("updated_at", "lt.2024-05-01T08:00:00.000000Z"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let conversation: opsdesk::model::Conversation = serde_json::from_value(json!({
        "id": "conv-1",
        "title": "usd to sgd rate",
        "created_at": "2024-05-01T07:00:00Z",
        "updated_at": "2024-05-01T08:00:00Z",
    }))
    .unwrap();
    store(&server).update(&conversation).await.unwrap();
}
