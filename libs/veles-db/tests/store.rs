use chrono::{Duration, Utc};
use veles_db::repositories::{
    InviteRepository, ServerRepository, SubscriptionRepository, UserRepository,
};

async fn pool() -> sqlx::SqlitePool {
    veles_db::connect("sqlite::memory:").await.unwrap()
}

#[tokio::test]
async fn upsert_mints_referral_code_once() {
    let pool = pool().await;
    let users = UserRepository::new(pool);
    let now = Utc::now();

    let first = users.upsert(42, Some("alice"), None, now).await.unwrap();
    let code = first.referral_code.clone().unwrap();
    assert!(code.starts_with("REF42"));

    let later = now + Duration::hours(5);
    let second = users
        .upsert(42, Some("alice_renamed"), Some("Alice"), later)
        .await
        .unwrap();
    assert_eq!(second.referral_code.as_deref(), Some(code.as_str()));
    assert_eq!(second.username.as_deref(), Some("alice_renamed"));
    assert_eq!(second.last_seen_at, Some(later));
}

#[tokio::test]
async fn second_active_subscription_violates_unique_index() {
    let pool = pool().await;
    let users = UserRepository::new(pool.clone());
    let servers = ServerRepository::new(pool.clone());
    let subs = SubscriptionRepository::new(pool.clone());
    let now = Utc::now();

    users.upsert(7, None, None, now).await.unwrap();
    let server_id = servers
        .create("eu-1", "https://panel.local:2053/", Some("admin"), Some("pw"), None, 1, now)
        .await
        .unwrap();

    let mut tx = pool.begin().await.unwrap();
    subs.create_tx(&mut tx, 7, server_id, "uuid-a", "vless://a", 30, 30, now, now + Duration::days(30))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let mut tx = pool.begin().await.unwrap();
    let err = subs
        .create_tx(&mut tx, 7, server_id, "uuid-b", "vless://b", 30, 30, now, now + Duration::days(30))
        .await
        .unwrap_err();
    match err {
        sqlx::Error::Database(db) => assert!(db.is_unique_violation()),
        other => panic!("expected unique violation, got {other}"),
    }
}

#[tokio::test]
async fn server_delete_blocked_while_referenced() {
    let pool = pool().await;
    let users = UserRepository::new(pool.clone());
    let servers = ServerRepository::new(pool.clone());
    let subs = SubscriptionRepository::new(pool.clone());
    let now = Utc::now();

    users.upsert(1, None, None, now).await.unwrap();
    let server_id = servers
        .create("eu-1", "https://panel.local/", None, None, Some("token"), 3, now)
        .await
        .unwrap();

    let mut tx = pool.begin().await.unwrap();
    let sub_id = subs
        .create_tx(&mut tx, 1, server_id, "uuid", "vless://x", 0, 30, now, now + Duration::days(30))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    assert!(servers.delete(server_id).await.is_err());

    // Once nothing references it, deletion goes through.
    subs.cancel(sub_id).await.unwrap();
    sqlx::query("DELETE FROM subscriptions WHERE id = $1")
        .bind(sub_id)
        .execute(&pool)
        .await
        .unwrap();
    servers.delete(server_id).await.unwrap();
    assert!(servers.get_by_id(server_id).await.unwrap().is_none());
}

#[tokio::test]
async fn invite_consumed_exactly_once() {
    let pool = pool().await;
    let users = UserRepository::new(pool.clone());
    let invites = InviteRepository::new(pool.clone());
    let now = Utc::now();

    users.upsert(10, Some("inviter"), None, now).await.unwrap();
    users.upsert(20, Some("friend"), None, now).await.unwrap();
    users.upsert(30, Some("latecomer"), None, now).await.unwrap();
    let code = invites.get_or_create_code(10, now).await.unwrap();

    let mut tx = pool.begin().await.unwrap();
    let winner = invites.consume_tx(&mut tx, &code, 20, now).await.unwrap();
    tx.commit().await.unwrap();
    assert_eq!(winner, Some(10));

    let mut tx = pool.begin().await.unwrap();
    let loser = invites.consume_tx(&mut tx, &code, 30, now).await.unwrap();
    tx.commit().await.unwrap();
    assert_eq!(loser, None);
}

#[tokio::test]
async fn self_invite_never_matches() {
    let pool = pool().await;
    let users = UserRepository::new(pool.clone());
    let invites = InviteRepository::new(pool.clone());
    let now = Utc::now();

    users.upsert(10, None, None, now).await.unwrap();
    let code = invites.get_or_create_code(10, now).await.unwrap();

    let mut tx = pool.begin().await.unwrap();
    assert_eq!(invites.consume_tx(&mut tx, &code, 10, now).await.unwrap(), None);
}

#[tokio::test]
async fn renewal_slot_claimed_at_most_once() {
    let pool = pool().await;
    let users = UserRepository::new(pool.clone());
    let servers = ServerRepository::new(pool.clone());
    let subs = SubscriptionRepository::new(pool.clone());
    let now = Utc::now();

    users.upsert(5, None, None, now).await.unwrap();
    let server_id = servers
        .create("eu-1", "https://panel.local/", None, None, Some("t"), 1, now)
        .await
        .unwrap();

    let mut tx = pool.begin().await.unwrap();
    let sub_id = subs
        .create_tx(&mut tx, 5, server_id, "first", "vless://first", 0, 30, now, now + Duration::days(2))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let mut tx = pool.begin().await.unwrap();
    let claimed = subs
        .apply_renewal_tx(&mut tx, sub_id, "second", "vless://second", now + Duration::days(32))
        .await
        .unwrap();
    tx.commit().await.unwrap();
    assert!(claimed);

    // The slot is taken: a second attempt matches no row and must not
    // overwrite the credential.
    let mut tx = pool.begin().await.unwrap();
    let claimed_again = subs
        .apply_renewal_tx(&mut tx, sub_id, "third", "vless://third", now + Duration::days(62))
        .await
        .unwrap();
    tx.commit().await.unwrap();
    assert!(!claimed_again);

    let row = subs.get_by_id(sub_id).await.unwrap().unwrap();
    assert_eq!(row.client_id, "second");
    assert!(row.renewal_used);
}

#[tokio::test]
async fn sweep_flips_only_overdue_rows() {
    let pool = pool().await;
    let users = UserRepository::new(pool.clone());
    let servers = ServerRepository::new(pool.clone());
    let subs = SubscriptionRepository::new(pool.clone());
    let now = Utc::now();

    users.upsert(1, None, None, now).await.unwrap();
    users.upsert(2, None, None, now).await.unwrap();
    let server_id = servers
        .create("eu-1", "https://panel.local/", None, None, Some("t"), 1, now)
        .await
        .unwrap();

    let mut tx = pool.begin().await.unwrap();
    let overdue = subs
        .create_tx(&mut tx, 1, server_id, "a", "vless://a", 0, 30, now - Duration::days(31), now - Duration::days(1))
        .await
        .unwrap();
    let current = subs
        .create_tx(&mut tx, 2, server_id, "b", "vless://b", 0, 30, now, now + Duration::days(1))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let affected = subs.sweep_expired(now).await.unwrap();
    assert_eq!(affected, 1);

    let flipped = subs.get_by_id(overdue).await.unwrap().unwrap();
    assert_eq!(flipped.status, "expired");
    assert!(!flipped.renewal_used);

    let untouched = subs.get_by_id(current).await.unwrap().unwrap();
    assert_eq!(untouched.status, "active");
}
