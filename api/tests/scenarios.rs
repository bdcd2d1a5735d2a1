//! End-to-end scenarios against a live app instance: full HTTP round
//! trips through admission, settlement, refunds, anti-snipe and balance
//! accounting. Every test self-skips when `DATABASE_URL` is unset.

use std::time::Duration;

use jiff::{Span, Timestamp};
use payloads::{
    APIClient, AuctionId, AuctionState, IdempotencyKey, TransactionType,
    requests::{CreateAuction, PlaceBid},
    responses::ErrorCode,
};
use test_helpers::{TestApp, spawn_app, wait_for};

fn key(s: &str) -> IdempotencyKey {
    IdempotencyKey::parse(s).expect("test idempotency key must be valid")
}

fn single_round_auction(
    gift_name: &str,
    gift_count: i64,
    start_at: Timestamp,
    duration_seconds: i64,
    prizes: Vec<i64>,
) -> CreateAuction {
    CreateAuction {
        name: format!("{gift_name} auction"),
        gift_name: gift_name.to_string(),
        gift_count,
        start_at,
        rounds: vec![payloads::RoundSpec {
            duration_seconds,
            prizes,
        }],
    }
}

async fn wait_for_state(
    client: &APIClient,
    auction_id: &AuctionId,
    state: AuctionState,
) -> bool {
    wait_for(
        || async {
            client
                .get_auction(auction_id)
                .await
                .map(|detail| detail.auction.state == state)
                .unwrap_or(false)
        },
        Duration::from_secs(5),
    )
    .await
}

/// Create an auction starting "now" and wait for the start job to fire.
async fn open_auction(
    app: &TestApp,
    author: &APIClient,
    details: &CreateAuction,
    idempotency_key: &IdempotencyKey,
) -> AuctionId {
    let created = author
        .create_auction(details, idempotency_key)
        .await
        .expect("create_auction");
    let auction_id = created.auction.id;
    assert!(
        wait_for_state(&app.anonymous_client(), &auction_id, AuctionState::Active)
            .await,
        "auction should activate"
    );
    auction_id
}

#[tokio::test]
async fn happy_path_single_round() -> anyhow::Result<()> {
    let Some(app) = spawn_app().await else { return Ok(()) };

    let author = app.client("author-hp");
    app.mint("author-hp", 1_000, Some(("Diamond", 10))).await?;
    let auction_id = open_auction(
        &app,
        &author,
        &single_round_auction(
            "Diamond",
            10,
            app.time_source.now(),
            30,
            vec![3, 2, 1],
        ),
        &key("happy-create-01"),
    )
    .await;

    for (user, stars) in
        [("hp-b1", 200), ("hp-b2", 150), ("hp-b3", 100), ("hp-b4", 50)]
    {
        app.mint(user, 500, None).await?;
        let placed = app
            .client(user)
            .place_bid(
                &PlaceBid {
                    auction_id,
                    stars,
                },
                &key(&format!("happy-bid-{user}")),
            )
            .await?;
        assert!(placed.success);
        assert_eq!(placed.bet, stars);
        assert_eq!(placed.charged, stars);
    }

    // balances are locked while the round runs
    let b1 = app.client("hp-b1").get_balance().await?;
    assert_eq!((b1.balance, b1.available, b1.locked), (500, 300, 200));

    app.advance(Span::new().seconds(31));
    assert!(
        wait_for_state(
            &app.anonymous_client(),
            &auction_id,
            AuctionState::Finished
        )
        .await,
        "auction should settle and finish"
    );

    // winners paid stars and received gifts; the loser kept everything
    for (user, balance, diamonds) in [
        ("hp-b1", 300, 3),
        ("hp-b2", 350, 2),
        ("hp-b3", 400, 1),
        ("hp-b4", 500, 0),
    ] {
        let summary = app.client(user).get_balance().await?;
        assert_eq!(summary.balance, balance, "balance of {user}");
        assert_eq!(summary.locked, 0, "locked of {user}");
        assert_eq!(summary.available, balance, "available of {user}");
        let count = summary
            .gifts
            .iter()
            .find(|g| g.name == "Diamond")
            .map(|g| g.count)
            .unwrap_or(0);
        assert_eq!(count, diamonds, "diamonds of {user}");
    }

    // author keeps the 4 gifts that were not configured as prizes
    let author_balance = author.get_balance().await?;
    let author_diamonds = author_balance
        .gifts
        .iter()
        .find(|g| g.name == "Diamond")
        .map(|g| g.count)
        .unwrap_or(0);
    assert_eq!(author_diamonds, 4);

    // winner records match the final ranking, place by place
    let detail = app.anonymous_client().get_auction(&auction_id).await?;
    let places: Vec<(i64, String, i64, i64)> = detail
        .auction
        .winners
        .iter()
        .map(|w| (w.place, w.user_id.0.clone(), w.stars, w.prize))
        .collect();
    assert_eq!(
        places,
        vec![
            (1, "hp-b1".into(), 200, 3),
            (2, "hp-b2".into(), 150, 2),
            (3, "hp-b3".into(), 100, 1),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn bids_cannot_decrease() -> anyhow::Result<()> {
    let Some(app) = spawn_app().await else { return Ok(()) };

    let author = app.client("author-mono");
    app.mint("author-mono", 0, Some(("Rose", 1))).await?;
    let auction_id = open_auction(
        &app,
        &author,
        &single_round_auction(
            "Rose",
            1,
            app.time_source.now(),
            60,
            vec![1],
        ),
        &key("mono-create-01"),
    )
    .await;

    app.mint("mono-bidder", 500, None).await?;
    let bidder = app.client("mono-bidder");
    bidder
        .place_bid(
            &PlaceBid {
                auction_id,
                stars: 200,
            },
            &key("mono-bid-0001"),
        )
        .await?;

    let rejection = bidder
        .place_bid(
            &PlaceBid {
                auction_id,
                stars: 100,
            },
            &key("mono-bid-0002"),
        )
        .await
        .expect_err("lower bid must be rejected");
    assert_eq!(rejection.error_code(), Some(ErrorCode::CannotDecrease));

    // the failed attempt changed nothing
    let balance = bidder.get_balance().await?;
    assert_eq!(balance.locked, 200);
    assert_eq!(balance.available, 300);

    let my_bid = bidder.get_my_bid(&auction_id).await?;
    assert_eq!(my_bid.bet, Some(200));
    Ok(())
}

#[tokio::test]
async fn repeated_bid_replays_and_charges_once() -> anyhow::Result<()> {
    let Some(app) = spawn_app().await else { return Ok(()) };

    let author = app.client("author-idem");
    app.mint("author-idem", 0, Some(("Star", 1))).await?;
    let auction_id = open_auction(
        &app,
        &author,
        &single_round_auction(
            "Star",
            1,
            app.time_source.now(),
            120,
            vec![1],
        ),
        &key("idem-create-01"),
    )
    .await;

    app.mint("idem-bidder", 500, None).await?;
    let bidder = app.client("idem-bidder");
    let request = PlaceBid {
        auction_id,
        stars: 200,
    };
    let shared_key = key("idem-bid-shared");

    let mut fresh = 0;
    let mut replayed = 0;
    for _ in 0..50 {
        let placed = bidder.place_bid(&request, &shared_key).await?;
        assert_eq!(placed.bet, 200);
        assert_eq!(placed.previous_bet, 0);
        assert_eq!(placed.charged, 200);
        if placed.idempotent {
            replayed += 1;
        } else {
            fresh += 1;
        }
        // stay under the bid rate limit while retrying
        app.advance(Span::new().milliseconds(300));
    }
    assert_eq!(fresh, 1);
    assert_eq!(replayed, 49);

    let balance = bidder.get_balance().await?;
    assert_eq!(balance.locked, 200);

    // exactly one ledger record, keyed by the shared idempotency key
    let transactions = bidder.get_transactions(50).await?;
    let bets: Vec<_> = transactions
        .iter()
        .filter(|t| t.op_id == shared_key.0)
        .collect();
    assert_eq!(bets.len(), 1);
    assert_eq!(bets[0].tx_type, TransactionType::Bet);
    assert_eq!(bets[0].amount, 200);
    Ok(())
}

#[tokio::test]
async fn round_without_bids_refunds_author() -> anyhow::Result<()> {
    let Some(app) = spawn_app().await else { return Ok(()) };

    let author = app.client("author-refund");
    app.mint("author-refund", 0, Some(("Rose", 6))).await?;
    let auction_id = open_auction(
        &app,
        &author,
        &single_round_auction(
            "Rose",
            6,
            app.time_source.now(),
            2,
            vec![2, 4],
        ),
        &key("refund-create-1"),
    )
    .await;

    // author's gifts are reserved by the auction
    let reserved = author.get_balance().await?;
    assert!(reserved.gifts.iter().all(|g| g.name != "Rose"));

    app.advance(Span::new().seconds(3));
    assert!(
        wait_for_state(
            &app.anonymous_client(),
            &auction_id,
            AuctionState::Finished
        )
        .await
    );

    // the full prize vector came back
    let refunded = author.get_balance().await?;
    let roses = refunded
        .gifts
        .iter()
        .find(|g| g.name == "Rose")
        .map(|g| g.count)
        .unwrap_or(0);
    assert_eq!(roses, 6);

    // one place-0 winner record, one deterministic refund ledger record
    let detail = app.anonymous_client().get_auction(&auction_id).await?;
    assert_eq!(detail.auction.winners.len(), 1);
    let record = &detail.auction.winners[0];
    assert_eq!((record.place, record.prize), (0, 6));
    assert_eq!(record.user_id.0, "author-refund");

    let expected_op_id =
        format!("{auction_id}:author-refund:win:0:place-0-refund");
    let transactions = author.get_transactions(10).await?;
    assert_eq!(
        transactions
            .iter()
            .filter(|t| t.op_id == expected_op_id)
            .count(),
        1
    );
    Ok(())
}

#[tokio::test]
async fn late_winning_bid_extends_the_round_once() -> anyhow::Result<()> {
    let Some(app) = spawn_app().await else { return Ok(()) };

    let author = app.client("author-snipe");
    app.mint("author-snipe", 0, Some(("Gem", 1))).await?;
    let auction_id = open_auction(
        &app,
        &author,
        &single_round_auction(
            "Gem",
            1,
            app.time_source.now(),
            12,
            vec![1],
        ),
        &key("snipe-create-1"),
    )
    .await;
    let original_end = app
        .anonymous_client()
        .get_auction(&auction_id)
        .await?
        .auction
        .round_end_at
        .expect("active auction has a deadline");

    for user in ["snipe-b1", "snipe-b2", "snipe-b3"] {
        app.mint(user, 500, None).await?;
    }

    // an early bid does not extend
    let placed = app
        .client("snipe-b1")
        .place_bid(
            &PlaceBid {
                auction_id,
                stars: 100,
            },
            &key("snipe-bid-early"),
        )
        .await?;
    assert!(!placed.extended);

    // a winning bid with ~3s remaining extends by 5s
    app.advance(Span::new().seconds(9));
    let placed = app
        .client("snipe-b2")
        .place_bid(
            &PlaceBid {
                auction_id,
                stars: 150,
            },
            &key("snipe-bid-late1"),
        )
        .await?;
    assert!(placed.extended);

    // a losing late bid does not extend again
    let placed = app
        .client("snipe-b3")
        .place_bid(
            &PlaceBid {
                auction_id,
                stars: 120,
            },
            &key("snipe-bid-late2"),
        )
        .await?;
    assert!(!placed.extended);

    let new_end = app
        .anonymous_client()
        .get_auction(&auction_id)
        .await?
        .auction
        .round_end_at
        .expect("still active");
    assert_eq!(new_end.as_second() - original_end.as_second(), 5);

    // past the original deadline the round is still running
    app.advance(Span::new().seconds(4));
    tokio::time::sleep(Duration::from_millis(300)).await;
    let detail = app.anonymous_client().get_auction(&auction_id).await?;
    assert_eq!(detail.auction.state, AuctionState::Active);

    // past the extended deadline it settles, and the sniper won
    app.advance(Span::new().seconds(5));
    assert!(
        wait_for_state(
            &app.anonymous_client(),
            &auction_id,
            AuctionState::Finished
        )
        .await
    );
    let detail = app.anonymous_client().get_auction(&auction_id).await?;
    assert_eq!(detail.auction.winners[0].user_id.0, "snipe-b2");
    Ok(())
}

#[tokio::test]
async fn concurrent_bids_cannot_double_spend() -> anyhow::Result<()> {
    let Some(app) = spawn_app().await else { return Ok(()) };

    let author = app.client("author-ds");
    app.mint("author-ds", 0, Some(("Coin", 2))).await?;
    let auction_a = open_auction(
        &app,
        &author,
        &single_round_auction(
            "Coin",
            1,
            app.time_source.now(),
            60,
            vec![1],
        ),
        &key("ds-create-a-01"),
    )
    .await;
    let auction_b = open_auction(
        &app,
        &author,
        &single_round_auction(
            "Coin",
            1,
            app.time_source.now(),
            60,
            vec![1],
        ),
        &key("ds-create-b-01"),
    )
    .await;

    app.mint("ds-spender", 500, None).await?;
    let bidder = app.client("ds-spender");

    let bid_a = PlaceBid {
        auction_id: auction_a,
        stars: 500,
    };
    let bid_a_key = key("ds-bid-a-00001");
    let bid_b = PlaceBid {
        auction_id: auction_b,
        stars: 500,
    };
    let bid_b_key = key("ds-bid-b-00001");
    let (first, second) = tokio::join!(
        bidder.place_bid(&bid_a, &bid_a_key),
        bidder.place_bid(&bid_b, &bid_b_key),
    );

    let outcomes = [first, second];
    let admitted = outcomes.iter().filter(|r| r.is_ok()).count();
    let rejected = outcomes
        .iter()
        .filter(|r| {
            r.as_ref().err().and_then(|e| e.error_code())
                == Some(ErrorCode::InsufficientBalance)
        })
        .count();
    assert_eq!(admitted, 1, "exactly one 500-star bid fits a 500 balance");
    assert_eq!(rejected, 1);

    let balance = bidder.get_balance().await?;
    assert_eq!(balance.balance, 500);
    assert_eq!(balance.locked, 500);
    assert_eq!(balance.available, 0);
    Ok(())
}

#[tokio::test]
async fn create_auction_is_idempotent_per_key() -> anyhow::Result<()> {
    let Some(app) = spawn_app().await else { return Ok(()) };

    let author = app.client("author-create");
    app.mint("author-create", 0, Some(("Pin", 5))).await?;
    let details = single_round_auction(
        "Pin",
        5,
        app.time_source.now(),
        60,
        vec![5],
    );
    let shared_key = key("create-once-001");

    let first = author.create_auction(&details, &shared_key).await?;
    assert!(!first.idempotent);
    let replay = author.create_auction(&details, &shared_key).await?;
    assert!(replay.idempotent);
    assert_eq!(replay.auction.id, first.auction.id);

    // gifts were reserved exactly once
    let balance = author.get_balance().await?;
    assert!(balance.gifts.iter().all(|g| g.name != "Pin"));
    let auctions = app.anonymous_client().get_auctions().await?;
    assert_eq!(
        auctions
            .iter()
            .filter(|a| a.gift_name == "Pin")
            .count(),
        1
    );

    // a different caller reusing the key is a conflict
    app.mint("create-intruder", 0, Some(("Pin", 5))).await?;
    let conflict = app
        .client("create-intruder")
        .create_auction(&details, &shared_key)
        .await
        .expect_err("same key, different author");
    assert_eq!(conflict.error_code(), Some(ErrorCode::IdempotencyConflict));
    Ok(())
}

#[tokio::test]
async fn bids_carry_over_between_rounds() -> anyhow::Result<()> {
    let Some(app) = spawn_app().await else { return Ok(()) };

    let author = app.client("author-multi");
    app.mint("author-multi", 0, Some(("Medal", 2))).await?;
    let details = CreateAuction {
        name: "Two rounds of medals".into(),
        gift_name: "Medal".into(),
        gift_count: 2,
        start_at: app.time_source.now(),
        rounds: vec![
            payloads::RoundSpec {
                duration_seconds: 5,
                prizes: vec![1],
            },
            payloads::RoundSpec {
                duration_seconds: 5,
                prizes: vec![1],
            },
        ],
    };
    let auction_id =
        open_auction(&app, &author, &details, &key("multi-create-01")).await;

    for (user, stars) in [("multi-b1", 100), ("multi-b2", 50)] {
        app.mint(user, 200, None).await?;
        app.client(user)
            .place_bid(
                &PlaceBid {
                    auction_id,
                    stars,
                },
                &key(&format!("multi-bid-{user}")),
            )
            .await?;
    }

    // round 0 settles; the runner-up's bid carries into round 1
    app.advance(Span::new().seconds(6));
    assert!(
        wait_for(
            || async {
                app.anonymous_client()
                    .get_auction(&auction_id)
                    .await
                    .map(|d| {
                        d.auction.state == AuctionState::Active
                            && d.auction.current_round == 1
                    })
                    .unwrap_or(false)
            },
            Duration::from_secs(5),
        )
        .await,
        "auction should advance to round 1"
    );

    let carried = app.client("multi-b2").get_my_bid(&auction_id).await?;
    assert_eq!(carried.bet, Some(50));
    assert_eq!(carried.rank, Some(1));

    app.advance(Span::new().seconds(6));
    assert!(
        wait_for_state(
            &app.anonymous_client(),
            &auction_id,
            AuctionState::Finished
        )
        .await
    );

    let detail = app.anonymous_client().get_auction(&auction_id).await?;
    let places: Vec<(i64, i64, String)> = detail
        .auction
        .winners
        .iter()
        .map(|w| (w.round_num, w.place, w.user_id.0.clone()))
        .collect();
    assert_eq!(
        places,
        vec![(0, 1, "multi-b1".into()), (1, 1, "multi-b2".into())]
    );

    // both winners paid their standing bid
    let b1 = app.client("multi-b1").get_balance().await?;
    let b2 = app.client("multi-b2").get_balance().await?;
    assert_eq!((b1.balance, b1.locked), (100, 0));
    assert_eq!((b2.balance, b2.locked), (150, 0));
    Ok(())
}

#[tokio::test]
async fn auction_stream_serves_snapshots() -> anyhow::Result<()> {
    let Some(app) = spawn_app().await else { return Ok(()) };

    let author = app.client("author-stream");
    app.mint("author-stream", 0, Some(("Orb", 1))).await?;
    let auction_id = open_auction(
        &app,
        &author,
        &single_round_auction(
            "Orb",
            1,
            app.time_source.now(),
            60,
            vec![1],
        ),
        &key("stream-create-1"),
    )
    .await;

    let response = reqwest::Client::new()
        .get(format!(
            "{}/api/stream/auction/{auction_id}",
            app.address()
        ))
        .send()
        .await?;
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );

    let mut response = response;
    let chunk = tokio::time::timeout(Duration::from_secs(5), response.chunk())
        .await
        .expect("stream should produce a snapshot within a tick")?
        .expect("stream should not close");
    let event = String::from_utf8_lossy(&chunk);
    assert!(event.starts_with("data: "));
    assert!(event.contains(&auction_id.to_string()));
    Ok(())
}
