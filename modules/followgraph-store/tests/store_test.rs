//! Postgres store tests.
//!
//! **Requires:** Docker (for Postgres via testcontainers).
//!
//! Run with: cargo test -p followgraph-store --test store_test -- --ignored

use chrono::Utc;

use followgraph_common::{
    AccountRef, BioTag, Direction, Hashtag, Institution, InstitutionInfo, Mention, Participant,
    Post, Profile,
};
use followgraph_store::testutil::postgres_container;

fn profile(id: i64, handle: &str, followers: i64) -> Profile {
    let mut p = Profile::skeletal(&AccountRef::new(id, handle), Utc::now());
    p.display_name = handle.to_uppercase();
    p.followers_count = followers;
    p
}

fn post(id: i64, author: &AccountRef, reply_to: Option<i64>) -> Post {
    Post {
        id,
        author: author.clone(),
        text: format!("post {id}"),
        posted_at: Some(Utc::now()),
        url: format!("https://x.com/{}/status/{id}", author.handle),
        reply_to_id: reply_to,
        quoted_id: None,
        retweeted_id: None,
        likes: 1,
        retweets: 0,
        replies: 0,
        mentions: vec![],
        hashtags: vec![],
        collected_at: Utc::now(),
    }
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn profile_insert_is_idempotent_and_update_overwrites() {
    let (_container, store) = postgres_container().await;

    assert!(store.insert_profile(&profile(1, "alice", 10)).await.unwrap());
    assert!(!store.insert_profile(&profile(1, "alice", 99)).await.unwrap());

    let mut renamed = profile(1, "alice_v2", 12);
    renamed.is_participant = true;
    store.update_profile(&renamed).await.unwrap();

    let stored = store.profile(1).await.unwrap().unwrap();
    assert_eq!(stored.handle, "alice_v2");
    assert_eq!(stored.followers_count, 12);
    assert!(stored.is_participant);
    assert_eq!(store.profile_id_by_handle("ALICE_V2").await.unwrap(), Some(1));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn edges_are_unique_per_pair() {
    let (_container, store) = postgres_container().await;
    store.insert_profile(&profile(1, "alice", 10)).await.unwrap();
    store.insert_profile(&profile(2, "bob", 3)).await.unwrap();

    let edge = Direction::Followers.edge(
        &AccountRef::new(1, "alice"),
        &AccountRef::new(2, "bob"),
        None,
        Utc::now(),
    );
    assert!(!store.edge_exists(2, 1).await.unwrap());
    assert!(store.insert_edge(&edge).await.unwrap());
    assert!(!store.insert_edge(&edge).await.unwrap());
    assert!(store.edge_exists(2, 1).await.unwrap());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn posts_mentions_and_hashtags_round_trip() {
    let (_container, store) = postgres_container().await;
    let alice = AccountRef::new(1, "alice");
    let bob = AccountRef::new(2, "bob");
    store.insert_profile(&profile(1, "alice", 10)).await.unwrap();
    store.insert_profile(&profile(2, "bob", 3)).await.unwrap();

    store.insert_post(&post(100, &bob, None)).await.unwrap();
    store.insert_post(&post(101, &alice, Some(100))).await.unwrap();
    assert!(store.post_exists(101).await.unwrap());
    assert_eq!(store.post_author(100).await.unwrap(), Some(2));

    let mention = Mention {
        post_id: 101,
        user_id: 2,
    };
    assert!(store.insert_mention(&mention).await.unwrap());
    assert!(!store.insert_mention(&mention).await.unwrap());

    let tag = Hashtag {
        post_id: 101,
        tag: "rust".into(),
    };
    assert!(store.insert_hashtag(&tag).await.unwrap());
    assert!(!store.insert_hashtag(&tag).await.unwrap());

    let bio = BioTag {
        user_id: 1,
        mentioned_user_id: 2,
        collected_at: Utc::now(),
    };
    assert!(store.insert_bio_tag(&bio).await.unwrap());
    assert!(!store.insert_bio_tag(&bio).await.unwrap());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn institution_and_participant_upserts() {
    let (_container, store) = postgres_container().await;
    store.insert_profile(&profile(5, "uni", 5000)).await.unwrap();
    store.insert_profile(&profile(6, "student", 40)).await.unwrap();

    assert!(!store.institution_registered(5).await.unwrap());
    let inst = Institution {
        info: InstitutionInfo {
            id: 7,
            name: "Example University".into(),
            top_rated: true,
            public: true,
            city: "Toronto".into(),
            state: "ON".into(),
            country: "CA".into(),
        },
        user_id: 5,
    };
    store.upsert_institution(&inst).await.unwrap();
    assert!(store.institution_registered(5).await.unwrap());

    let participant = Participant {
        institution_id: 7,
        cohort: 2023,
        user_id: 6,
    };
    store.upsert_participant(&participant).await.unwrap();
    store
        .upsert_participant(&Participant {
            cohort: 2024,
            ..participant
        })
        .await
        .unwrap();
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn backlog_replays_in_acceptance_order() {
    let (_container, store) = postgres_container().await;
    let alice = AccountRef::new(1, "alice");
    let bob = AccountRef::new(2, "bob");

    let first = store.enqueue_backlog(&alice, Direction::Followers).await.unwrap();
    let second = store.enqueue_backlog(&bob, Direction::Following).await.unwrap();

    let pending = store.pending_backlog().await.unwrap();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].id, first);
    assert_eq!(pending[0].direction, Direction::Followers);
    assert_eq!(pending[1].account, bob);

    store.complete_backlog(second).await.unwrap();
    let pending = store.pending_backlog().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].account, alice);
}
