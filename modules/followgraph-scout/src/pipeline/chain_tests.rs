//! Chain tests: end-to-end with mocks.
//!
//! Each test follows MOCK → PIPELINE → STORE:
//! set up the fake upstream, submit requests to a real running pipeline, shut
//! it down (which drains every worker), then assert what was persisted.

use std::sync::Arc;

use followgraph_common::{AccountRef, Direction, Enrollment, InstitutionInfo, Reply, ScrapeRequest};

use super::status::{WorkerRole, WorkerState};
use super::{Pipeline, PipelineDeps, PipelineSettings};
use crate::testing::*;

fn start(source: &Arc<MockProfileSource>, repo: &Arc<MemoryRepository>) -> Pipeline {
    start_with(source, repo, fast_settings())
}

fn start_with(
    source: &Arc<MockProfileSource>,
    repo: &Arc<MemoryRepository>,
    settings: PipelineSettings,
) -> Pipeline {
    Pipeline::start(PipelineDeps::shared(source.clone(), repo.clone()), settings)
}

/// Every stored edge points at two stored profiles.
fn assert_edges_closed(repo: &MemoryRepository) {
    for (follower, followee) in repo.edge_keys() {
        assert!(repo.profile(follower).is_some(), "dangling follower {follower}");
        assert!(repo.profile(followee).is_some(), "dangling followee {followee}");
    }
}

// ---------------------------------------------------------------------------
// Chain Test 1: Idempotent resubmission
//
// Same request twice → one insert, then an update. One row.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn resubmitting_same_request_inserts_once_then_updates() {
    let source = Arc::new(MockProfileSource::new().on_profile(profile(1, "alice", 10, 5)));
    let repo = Arc::new(MemoryRepository::new());

    let pipeline = start(&source, &repo);
    pipeline.submit(ScrapeRequest::new("alice")).await.unwrap();
    pipeline.submit(ScrapeRequest::new("@alice")).await.unwrap();
    pipeline.shutdown().await.unwrap();

    assert_eq!(repo.profile_count(), 1);
    assert_eq!(repo.profile_inserts(), 1);
    assert_eq!(repo.profile_updates(), 1);
    assert_eq!(source.profile_calls("alice"), 2);
    assert!(source.connection_calls().is_empty());
}

// ---------------------------------------------------------------------------
// Chain Test 2: Follow ceiling at the profile stage
//
// alice has 5,000 followers and follows 3 → only the following list is
// requested.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn over_ceiling_followers_are_never_requested() {
    let source = Arc::new(
        MockProfileSource::new()
            .on_profile(profile(1, "alice", 5_000, 3))
            .on_profile(profile(2, "bob", 10, 10))
            .on_following(1, vec![vec![entry(2, "bob")]]),
    );
    let repo = Arc::new(MemoryRepository::new());

    let pipeline = start(&source, &repo);
    pipeline
        .submit(ScrapeRequest::new("alice").with_connections())
        .await
        .unwrap();
    pipeline.shutdown().await.unwrap();

    assert_eq!(source.fetches_for(1, Direction::Followers), 0);
    assert_eq!(source.fetches_for(1, Direction::Following), 1);
    assert_eq!(repo.edge_keys(), vec![(1, 2)]);
    assert_edges_closed(&repo);
}

// ---------------------------------------------------------------------------
// Chain Test 3: alice and bob
//
// alice (10 followers) is submitted; bob, already stored, follows alice.
// bob's own following list repeats the same edge during closure.
// → Edge{bob → alice} exactly once.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn known_follower_edge_is_inserted_exactly_once() {
    let source = Arc::new(
        MockProfileSource::new()
            .on_profile(profile(1, "alice", 10, 0))
            .on_profile(profile(2, "bob", 40, 12))
            .on_followers(1, vec![vec![entry(2, "bob")]])
            .on_following(1, vec![vec![]])
            .on_followers(2, vec![vec![]])
            .on_following(2, vec![vec![entry(1, "alice")]]),
    );
    let repo = Arc::new(MemoryRepository::new().with_profile(profile(2, "bob", 40, 12)));

    let pipeline = start(&source, &repo);
    pipeline
        .submit(ScrapeRequest::new("alice").with_connections())
        .await
        .unwrap();
    pipeline.shutdown().await.unwrap();

    assert_eq!(repo.edge_keys(), vec![(2, 1)]);
    // Stored already, so only the closure refresh fetched bob.
    assert_eq!(source.profile_calls("bob"), 1);
    assert_eq!(source.fetches_for(2, Direction::Following), 1);
    assert_eq!(repo.backlog_len(), 0);
}

// ---------------------------------------------------------------------------
// Chain Test 4: Failed page
//
// alice's followers span 5 pages and page 3 fails → nothing from that list is
// stored. The next request (dave) still goes through.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failed_page_commits_nothing_and_pipeline_keeps_going() {
    let pages = (0..5)
        .map(|i| vec![entry(100 + i, &format!("fan{i}"))])
        .collect();
    let mut sources = MockProfileSource::new()
        .on_profile(profile(1, "alice", 5, 0))
        .on_followers(1, pages)
        .failing_page(1, Direction::Followers, 2)
        .on_following(1, vec![vec![]])
        .on_profile(profile(4, "dave", 1, 0))
        .on_followers(4, vec![vec![entry(5, "erin")]])
        .on_following(4, vec![vec![]])
        .on_profile(profile(5, "erin", 1, 1));
    for i in 0..5 {
        sources = sources.on_profile(profile(100 + i, &format!("fan{i}"), 1, 1));
    }
    let source = Arc::new(sources);
    let repo = Arc::new(MemoryRepository::new());

    let pipeline = start(&source, &repo);
    pipeline
        .submit(ScrapeRequest::new("alice").with_connections())
        .await
        .unwrap();
    pipeline
        .submit(ScrapeRequest::new("dave").with_connections())
        .await
        .unwrap();
    pipeline.shutdown().await.unwrap();

    let pages_tried: Vec<usize> = source
        .connection_calls()
        .iter()
        .filter(|c| c.account_id == 1 && c.direction == Direction::Followers)
        .map(|c| c.page)
        .collect();
    assert_eq!(pages_tried, vec![1, 2, 3]);
    assert!(repo.edge_keys().iter().all(|(_, followee)| *followee != 1));
    assert!(repo.has_edge(5, 4));
    for i in 0..5 {
        assert!(repo.profile(100 + i).is_none());
    }
    assert_eq!(repo.backlog_len(), 0);
}

// ---------------------------------------------------------------------------
// Chain Test 5: Follow ceiling at the closure stage
//
// alice's followers are carol (50,000 followers) and bob. carol is stored as a
// follower but never queried; bob is queried, and the bob → carol edge closes. The
// bob → dave edge (dave never stored) does not.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn over_ceiling_peer_is_skipped_and_batch_continues() {
    let source = Arc::new(
        MockProfileSource::new()
            .on_profile(profile(1, "alice", 2, 0))
            .on_profile(profile(3, "carol", 50_000, 20))
            .on_profile(profile(2, "bob", 30, 3))
            .on_followers(1, vec![vec![entry(3, "carol"), entry(2, "bob")]])
            .on_following(1, vec![vec![]])
            .on_followers(2, vec![vec![]])
            .on_following(
                2,
                vec![vec![entry(1, "alice"), entry(3, "carol"), entry(4, "dave")]],
            ),
    );
    let repo = Arc::new(MemoryRepository::new());

    let pipeline = start(&source, &repo);
    pipeline
        .submit(ScrapeRequest::new("alice").with_connections())
        .await
        .unwrap();
    pipeline.shutdown().await.unwrap();

    assert_eq!(source.fetches_for(3, Direction::Followers), 0);
    assert_eq!(source.fetches_for(3, Direction::Following), 0);
    assert_eq!(source.fetches_for(2, Direction::Followers), 1);
    assert_eq!(source.fetches_for(2, Direction::Following), 1);

    let mut edges = repo.edge_keys();
    edges.sort_unstable();
    assert_eq!(edges, vec![(2, 1), (2, 3), (3, 1)]);
    assert!(repo.profile(4).is_none());
    assert_edges_closed(&repo);
}

// ---------------------------------------------------------------------------
// Chain Test 6: Closure never creates profiles
//
// bob and carol follow alice. Their own lists point at each other, at frank
// (already stored) and at strangers. Only edges between stored accounts land.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn closure_only_links_stored_accounts() {
    let source = Arc::new(
        MockProfileSource::new()
            .on_profile(profile(1, "alice", 3, 0))
            .on_profile(profile(2, "bob", 5, 5))
            .on_profile(profile(3, "carol", 5, 5))
            .on_followers(1, vec![vec![entry(2, "bob"), entry(3, "carol")]])
            .on_following(1, vec![vec![]])
            .on_followers(2, vec![vec![entry(3, "carol"), entry(90, "stranger")]])
            .on_following(2, vec![vec![entry(91, "other"), entry(6, "frank")]])
            .on_followers(3, vec![vec![entry(92, "x")], vec![entry(2, "bob")]])
            .on_following(3, vec![vec![]]),
    );
    let repo = Arc::new(MemoryRepository::new().with_profile(profile(6, "frank", 5, 5)));

    let pipeline = start(&source, &repo);
    pipeline
        .submit(ScrapeRequest::new("alice").with_connections())
        .await
        .unwrap();
    pipeline.shutdown().await.unwrap();

    assert_edges_closed(&repo);
    assert!(repo.has_edge(3, 2));
    assert!(repo.has_edge(2, 6));
    assert!(repo.has_edge(2, 3));
    for stranger in [90, 91, 92] {
        assert!(repo.profile(stranger).is_none());
    }
    // No duplicates even though several lists repeat the same pairs.
    let keys = repo.edge_keys();
    let unique: std::collections::HashSet<_> = keys.iter().collect();
    assert_eq!(unique.len(), keys.len());
    assert_eq!(keys.len(), 5);
}

// ---------------------------------------------------------------------------
// Chain Test 7: Timeline harvest with cutoff and reply chains
//
// alice's newest post replies to bob's post 5, which replies to carol's post 4.
// The second page starts past the cutoff, so harvesting stops there.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn timeline_stops_at_start_date_and_resolves_reply_chain() {
    let alice = alice();
    let bob = bob();
    let carol = AccountRef::new(3, "carol");

    let mut newest = post(10, &alice, 1);
    newest.reply_to_id = Some(5);
    newest.mentions = vec![bob.clone()];
    newest.hashtags = vec!["rust".into()];
    let mut bobs = post(5, &bob, 2);
    bobs.reply_to_id = Some(4);
    let carols = post(4, &carol, 3);

    let source = Arc::new(
        MockProfileSource::new()
            .on_profile(profile(1, "alice", 10, 10))
            .on_posts(
                1,
                vec![
                    vec![newest, post(11, &alice, 2)],
                    vec![post(12, &alice, 40), post(13, &alice, 41)],
                ],
            )
            .on_post(bobs)
            .on_post(carols),
    );
    let repo = Arc::new(MemoryRepository::new());

    let pipeline = start(&source, &repo);
    let request = ScrapeRequest::new("alice").with_content(Some(reference_date() - chrono::Duration::days(30)));
    pipeline.submit(request).await.unwrap();
    pipeline.shutdown().await.unwrap();

    assert_eq!(repo.post_ids(), vec![4, 5, 10, 11]);
    assert_eq!(source.timeline_calls(), 2);
    assert_eq!(source.post_lookups(), vec![5, 4]);

    // Referenced authors exist as identity-only rows.
    let carol_row = repo.profile(3).unwrap();
    assert_eq!(carol_row.handle, "carol");
    assert_eq!(carol_row.followers_count, 0);

    let replies = repo.replies();
    assert!(replies.contains(&Reply {
        post_id: 10,
        replied_to_user_id: 2
    }));
    assert!(replies.contains(&Reply {
        post_id: 5,
        replied_to_user_id: 3
    }));
    assert_eq!(repo.mentions().len(), 1);
    assert_eq!(repo.hashtags().len(), 1);
}

// ---------------------------------------------------------------------------
// Chain Test 8: Cyclic and deep reference chains terminate
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cyclic_reply_chain_terminates() {
    let alice = alice();
    let bob = bob();
    let mut first = post(20, &alice, 1);
    first.reply_to_id = Some(21);
    let mut second = post(21, &bob, 2);
    second.reply_to_id = Some(20);

    let source = Arc::new(
        MockProfileSource::new()
            .on_profile(profile(1, "alice", 1, 1))
            .on_posts(1, vec![vec![first.clone()]])
            .on_post(first)
            .on_post(second),
    );
    let repo = Arc::new(MemoryRepository::new());

    let pipeline = start(&source, &repo);
    pipeline
        .submit(ScrapeRequest::new("alice").with_content(None))
        .await
        .unwrap();
    pipeline.shutdown().await.unwrap();

    assert_eq!(source.post_lookups(), vec![21]);
    assert_eq!(repo.post_ids(), vec![20, 21]);
    assert_eq!(repo.post(20).unwrap().reply_to_id, Some(21));
    // Its parent was still being resolved when it was stored.
    assert_eq!(repo.post(21).unwrap().reply_to_id, None);
}

#[tokio::test]
async fn deep_chain_stops_at_depth_limit() {
    let alice = alice();
    let mut source = MockProfileSource::new().on_profile(profile(1, "alice", 1, 1));
    let mut head = post(30, &alice, 1);
    head.reply_to_id = Some(31);
    source = source.on_posts(1, vec![vec![head]]);
    for id in 31..=40 {
        let mut p = post(id, &alice, 2);
        p.reply_to_id = Some(id + 1);
        source = source.on_post(p);
    }
    let source = Arc::new(source);
    let repo = Arc::new(MemoryRepository::new());

    let settings = PipelineSettings::builder()
        .page_interval(std::time::Duration::ZERO)
        .account_interval(std::time::Duration::ZERO)
        .max_chain_depth(2)
        .build();
    let pipeline = start_with(&source, &repo, settings);
    pipeline
        .submit(ScrapeRequest::new("alice").with_content(None))
        .await
        .unwrap();
    pipeline.shutdown().await.unwrap();

    assert_eq!(source.post_lookups(), vec![31, 32]);
    assert_eq!(repo.post_ids(), vec![30, 31, 32]);
    assert_eq!(repo.post(32).unwrap().reply_to_id, None);
}

// ---------------------------------------------------------------------------
// Chain Test 9: Provenance
//
// An institutional account is registered once; a participant is enrolled in
// its cohort and flagged; bio mentions become bio tags.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn institution_participant_and_bio_tags_are_recorded() {
    let mut uni = profile(50, "uoft", 20_000, 300);
    uni.bio = "Official account. Athletics: @uoft_varsity, contact press@uoft.ca".into();
    let mut student = profile(51, "sam", 40, 80);
    student.bio = "CS '24 @UofT".into();

    let source = Arc::new(
        MockProfileSource::new()
            .on_profile(uni)
            .on_profile(student)
            .on_profile(profile(52, "uoft_varsity", 900, 10)),
    );
    let repo = Arc::new(MemoryRepository::new());

    let info = InstitutionInfo {
        id: 7,
        name: "University of Toronto".into(),
        top_rated: true,
        public: true,
        city: "Toronto".into(),
        state: "ON".into(),
        country: "CA".into(),
    };
    let pipeline = start(&source, &repo);
    pipeline
        .submit(ScrapeRequest::new("uoft").institutional(info.clone()))
        .await
        .unwrap();
    pipeline
        .submit(ScrapeRequest::new("uoft").institutional(info))
        .await
        .unwrap();
    pipeline
        .submit(ScrapeRequest::new("sam").enrolled(Enrollment {
            institution_id: 7,
            cohort: 2024,
        }))
        .await
        .unwrap();
    pipeline.shutdown().await.unwrap();

    assert_eq!(repo.institution(7).unwrap().user_id, 50);
    assert_eq!(repo.cohort(7, 51), Some(2024));
    assert!(repo.profile(51).unwrap().is_participant);
    assert!(!repo.profile(50).unwrap().is_participant);

    let tags = repo.bio_tags();
    assert!(tags.contains(&(50, 52)));
    assert!(tags.contains(&(51, 50)));
    assert_eq!(tags.len(), 2);
    // Resolved once, then found by handle in the store.
    assert_eq!(source.profile_calls("uoft_varsity"), 1);
}

// ---------------------------------------------------------------------------
// Chain Test 10: Backlog replay
//
// A job left over from a previous run is replayed and cleared.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn replayed_backlog_job_runs_and_clears() {
    let source = Arc::new(
        MockProfileSource::new()
            .on_profile(profile(2, "bob", 3, 3))
            .on_followers(1, vec![vec![entry(2, "bob")]])
            .on_followers(2, vec![vec![]])
            .on_following(2, vec![vec![]]),
    );
    let repo = Arc::new(
        MemoryRepository::new()
            .with_profile(profile(1, "alice", 1, 0))
            .with_backlog(alice(), Direction::Followers),
    );

    let pipeline = start(&source, &repo);
    assert_eq!(pipeline.replay_backlog().await.unwrap(), 1);
    pipeline.shutdown().await.unwrap();

    assert_eq!(repo.edge_keys(), vec![(2, 1)]);
    assert_eq!(repo.backlog_len(), 0);
    // The subject was already stored, so only bob was fetched.
    assert_eq!(source.profile_calls("alice"), 0);
}

// ---------------------------------------------------------------------------
// Chain Test 11: Shutdown drains and stops every role
// ---------------------------------------------------------------------------

#[tokio::test]
async fn shutdown_stops_every_worker() {
    let source = Arc::new(MockProfileSource::new());
    let repo = Arc::new(MemoryRepository::new());

    let pipeline = start(&source, &repo);
    let running = pipeline.status();
    for role in WorkerRole::ALL {
        assert_ne!(running.get(role), Some(&WorkerState::Stopped));
    }

    // Unknown handle: logged and skipped, nothing else happens.
    pipeline.submit(ScrapeRequest::new("nobody")).await.unwrap();
    let stopped = pipeline.shutdown().await.unwrap();

    for role in WorkerRole::ALL {
        assert_eq!(stopped.get(role), Some(&WorkerState::Stopped), "{}", role.as_str());
    }
    assert!(stopped.all_stopped());
    assert_eq!(repo.profile_count(), 0);
}

// ---------------------------------------------------------------------------
// Chain Test 12: Connection jobs are durable while still queued
//
// alice and dave both ask for connections. Each list is two pages, and the
// queues wait 30s between pages, so the first fetches are still in flight when
// the profile stage is done. All four accepted jobs must already have a
// backlog row; they clear once the pipeline drains.
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn queued_connection_jobs_are_in_the_backlog() {
    let two_pages = || vec![vec![], vec![]];
    let source = Arc::new(
        MockProfileSource::new()
            .on_profile(profile(1, "alice", 4, 4))
            .on_profile(profile(4, "dave", 4, 4))
            .on_followers(1, two_pages())
            .on_following(1, two_pages())
            .on_followers(4, two_pages())
            .on_following(4, two_pages()),
    );
    let repo = Arc::new(MemoryRepository::new());

    let settings = PipelineSettings::builder()
        .page_interval(std::time::Duration::from_secs(30))
        .account_interval(std::time::Duration::ZERO)
        .build();
    let pipeline = start_with(&source, &repo, settings);
    for handle in ["alice", "dave"] {
        pipeline
            .submit(ScrapeRequest::new(handle).with_connections())
            .await
            .unwrap();
    }

    // Yielding keeps the paused clock still, so the page sleeps can't elapse.
    let mut spins = 0;
    while source.profile_calls("dave") == 0
        || pipeline.status().get(WorkerRole::Profile) != Some(&WorkerState::Idle)
    {
        spins += 1;
        assert!(spins < 10_000, "profile stage never went idle");
        tokio::task::yield_now().await;
    }

    assert_eq!(repo.backlog_len(), 4);
    assert_eq!(source.fetches_for(4, Direction::Followers), 0);
    assert_eq!(source.fetches_for(4, Direction::Following), 0);

    pipeline.shutdown().await.unwrap();

    assert_eq!(repo.backlog_len(), 0);
    for id in [1, 4] {
        assert_eq!(source.fetches_for(id, Direction::Followers), 1);
        assert_eq!(source.fetches_for(id, Direction::Following), 1);
    }
}

// ---------------------------------------------------------------------------
// Chain Test 13: Quote and retweet chains
//
// alice quotes bob's post 61 and retweets carol's post 63, which itself quotes
// bob's post 64. Post 66 both quotes 61 and retweets 63; both are already
// stored by then, so nothing is looked up twice.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn quote_and_retweet_chains_are_resolved() {
    let alice = alice();
    let bob = bob();
    let carol = AccountRef::new(3, "carol");

    let mut quoting = post(60, &alice, 1);
    quoting.quoted_id = Some(61);
    let mut retweet = post(62, &alice, 2);
    retweet.retweeted_id = Some(63);
    let mut carols = post(63, &carol, 5);
    carols.quoted_id = Some(64);
    let mut both = post(66, &alice, 3);
    both.quoted_id = Some(61);
    both.retweeted_id = Some(63);

    let source = Arc::new(
        MockProfileSource::new()
            .on_profile(profile(1, "alice", 10, 10))
            .on_posts(1, vec![vec![quoting, retweet, both]])
            .on_post(post(61, &bob, 4))
            .on_post(carols)
            .on_post(post(64, &bob, 9)),
    );
    let repo = Arc::new(MemoryRepository::new());

    let pipeline = start(&source, &repo);
    pipeline
        .submit(ScrapeRequest::new("alice").with_content(None))
        .await
        .unwrap();
    pipeline.shutdown().await.unwrap();

    assert_eq!(source.post_lookups(), vec![61, 63, 64]);
    assert_eq!(repo.post_ids(), vec![60, 61, 62, 63, 64, 66]);

    assert_eq!(repo.post(60).unwrap().quoted_id, Some(61));
    let stored_retweet = repo.post(62).unwrap();
    assert!(stored_retweet.is_retweet());
    assert_eq!(stored_retweet.repeated_id(), Some(63));
    assert_eq!(repo.post(63).unwrap().repeated_id(), Some(64));
    // One repeat column: the retweet wins over the quote.
    let stored_both = repo.post(66).unwrap();
    assert!(stored_both.is_retweet());
    assert_eq!(stored_both.repeated_id(), Some(63));

    assert_eq!(repo.profile(3).unwrap().handle, "carol");
    assert_eq!(repo.profile(2).unwrap().followers_count, 0);
    assert!(repo.replies().is_empty());
}

#[tokio::test]
async fn unavailable_quote_and_retweet_targets_are_cleared() {
    let alice = alice();
    let mut quoting = post(70, &alice, 1);
    quoting.quoted_id = Some(71);
    let mut retweet = post(72, &alice, 2);
    retweet.retweeted_id = Some(73);

    let source = Arc::new(
        MockProfileSource::new()
            .on_profile(profile(1, "alice", 10, 10))
            .on_posts(1, vec![vec![quoting, retweet]]),
    );
    let repo = Arc::new(MemoryRepository::new());

    let pipeline = start(&source, &repo);
    pipeline
        .submit(ScrapeRequest::new("alice").with_content(None))
        .await
        .unwrap();
    pipeline.shutdown().await.unwrap();

    assert_eq!(source.post_lookups(), vec![71, 73]);
    assert_eq!(repo.post_ids(), vec![70, 72]);
    assert_eq!(repo.post(70).unwrap().quoted_id, None);
    let stored_retweet = repo.post(72).unwrap();
    assert_eq!(stored_retweet.retweeted_id, None);
    assert_eq!(stored_retweet.repeated_id(), None);
}
