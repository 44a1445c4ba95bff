//! JSON helpers against the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use slotkeeper_store::{
    get_json, invite_key, session_key, set_json, MemoryStore, Store, StoreError,
};

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Record {
    token: String,
    use_count: u32,
}

#[test]
fn test_key_schema() {
    assert_eq!(invite_key("abcd-1234"), "invite:abcd-1234");
    assert_eq!(session_key(42), "session:42");
}

#[tokio::test]
async fn test_json_round_trip_through_arc() {
    let store = Arc::new(MemoryStore::new());
    let record = Record {
        token: "abcd".into(),
        use_count: 2,
    };

    set_json(&store, "invite:abcd", &record, Duration::from_secs(60))
        .await
        .unwrap();
    let back: Option<Record> = get_json(&store, "invite:abcd").await.unwrap();

    assert_eq!(back, Some(record));
}

#[tokio::test]
async fn test_get_json_on_corrupt_value_is_serialization_error() {
    let store = MemoryStore::new();
    store
        .set("invite:bad", "{oops", Duration::from_secs(60))
        .await
        .unwrap();

    let result: Result<Option<Record>, _> = get_json(&store, "invite:bad").await;

    assert!(matches!(result, Err(StoreError::Serialization(_))));
}
