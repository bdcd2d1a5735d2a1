//! Server-sent event streams over the notification bus.
//!
//! Each response starts with the cached snapshot (when one is fresh) so
//! clients render immediately, then relays everything published on the
//! underlying channel. A slow client that lags the broadcast buffer skips
//! ahead to newer snapshots; snapshots are self-contained, so nothing is
//! lost.

use std::pin::Pin;
use std::task::{Context, Poll};

use actix_web::{HttpResponse, get, web};
use payloads::AuctionId;
use sqlx::PgPool;
use tokio_stream::{Stream, StreamExt, wrappers::BroadcastStream};
use uuid::Uuid;

use crate::notify::{AuctionSubscription, NotificationBus};
use crate::routes::ApiError;
use crate::store::auction;

fn sse_event(payload: &str) -> web::Bytes {
    web::Bytes::from(format!("data: {payload}\n\n"))
}

/// Wraps the event stream together with the bus subscription guard, so a
/// client disconnect releases the producer refcount.
struct SseStream<S> {
    inner: S,
    _subscription: Option<AuctionSubscription>,
}

impl<S> Stream for SseStream<S>
where
    S: Stream<Item = Result<web::Bytes, actix_web::Error>> + Unpin,
{
    type Item = Result<web::Bytes, actix_web::Error>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

fn sse_response(
    seed: Option<String>,
    rx: tokio::sync::broadcast::Receiver<String>,
    subscription: Option<AuctionSubscription>,
) -> HttpResponse {
    let seed_stream = tokio_stream::iter(
        seed.into_iter()
            .map(|payload| Ok::<_, actix_web::Error>(sse_event(&payload))),
    );
    let live = BroadcastStream::new(rx)
        .filter_map(|message| message.ok())
        .map(|payload| Ok::<_, actix_web::Error>(sse_event(&payload)));

    HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header(("cache-control", "no-cache"))
        .streaming(SseStream {
            inner: seed_stream.chain(live),
            _subscription: subscription,
        })
}

/// Snapshots of all open auctions, roughly once a second.
#[tracing::instrument(skip_all)]
#[get("/stream/auctions")]
pub async fn stream_auctions(
    notifier: web::Data<NotificationBus>,
) -> Result<HttpResponse, ApiError> {
    let (seed, rx) = notifier.subscribe_all();
    Ok(sse_response(seed, rx, None))
}

/// Snapshots of one auction, roughly twice a second, ending with a
/// terminal snapshot once the auction finishes.
#[tracing::instrument(skip_all, fields(%auction_id))]
#[get("/stream/auction/{auction_id}")]
pub async fn stream_auction(
    auction_id: web::Path<Uuid>,
    pool: web::Data<PgPool>,
    notifier: web::Data<NotificationBus>,
) -> Result<HttpResponse, ApiError> {
    let auction_id = AuctionId(auction_id.into_inner());
    // unknown auctions are a 404, not an empty stream
    auction::read_auction(&pool, &auction_id).await?;

    let (seed, rx, subscription) =
        notifier.into_inner().subscribe_auction(auction_id);
    Ok(sse_response(seed, rx, Some(subscription)))
}
