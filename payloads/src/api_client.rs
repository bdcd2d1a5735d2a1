use reqwest::StatusCode;
use serde::Serialize;

use crate::{AuctionId, IdempotencyKey, UserId, requests, responses};

type ReqwestResult = Result<reqwest::Response, reqwest::Error>;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const IDEMPOTENCY_KEY_HEADER: &str = "x-idempotency-key";

/// An API client for interfacing with the auction service.
///
/// The service trusts the caller id header, so the client simply carries
/// the id it was built with.
pub struct APIClient {
    pub address: String,
    pub user_id: Option<UserId>,
    pub inner_client: reqwest::Client,
}

/// Helper methods for http actions
impl APIClient {
    pub fn new(address: impl Into<String>, user_id: Option<UserId>) -> Self {
        Self {
            address: address.into(),
            user_id,
            inner_client: reqwest::Client::new(),
        }
    }

    fn format_url(&self, path: &str) -> String {
        format!("{}/api/{path}", &self.address)
    }

    fn with_identity(
        &self,
        request: reqwest::RequestBuilder,
    ) -> reqwest::RequestBuilder {
        match &self.user_id {
            Some(user_id) => request.header(USER_ID_HEADER, &user_id.0),
            None => request,
        }
    }

    async fn post(
        &self,
        path: &str,
        body: &impl Serialize,
        idempotency_key: Option<&IdempotencyKey>,
    ) -> ReqwestResult {
        let mut request = self
            .with_identity(self.inner_client.post(self.format_url(path)))
            .json(body);
        if let Some(key) = idempotency_key {
            request = request.header(IDEMPOTENCY_KEY_HEADER, &key.0);
        }
        request.send().await
    }

    async fn get(&self, path: &str) -> ReqwestResult {
        self.with_identity(self.inner_client.get(self.format_url(path)))
            .send()
            .await
    }
}

/// Methods on the service API
impl APIClient {
    pub async fn health_check(&self) -> Result<(), ClientError> {
        let response = self.get("health_check").await?;
        ok_empty(response).await
    }

    pub async fn place_bid(
        &self,
        details: &requests::PlaceBid,
        idempotency_key: &IdempotencyKey,
    ) -> Result<responses::BidPlaced, ClientError> {
        let response = self
            .post("place_bid", details, Some(idempotency_key))
            .await?;
        ok_body(response).await
    }

    pub async fn create_auction(
        &self,
        details: &requests::CreateAuction,
        idempotency_key: &IdempotencyKey,
    ) -> Result<responses::AuctionCreated, ClientError> {
        let response = self
            .post("create_auction", details, Some(idempotency_key))
            .await?;
        ok_body(response).await
    }

    pub async fn get_auctions(
        &self,
    ) -> Result<Vec<responses::AuctionSummary>, ClientError> {
        let response = self.get("auctions").await?;
        ok_body(response).await
    }

    pub async fn get_auction(
        &self,
        auction_id: &AuctionId,
    ) -> Result<responses::AuctionDetail, ClientError> {
        let response = self.get(&format!("auction/{auction_id}")).await?;
        ok_body(response).await
    }

    pub async fn get_auction_bids(
        &self,
        auction_id: &AuctionId,
        limit: i64,
    ) -> Result<responses::AuctionBids, ClientError> {
        let response = self
            .get(&format!("auction/{auction_id}/bids?limit={limit}"))
            .await?;
        ok_body(response).await
    }

    pub async fn get_my_bid(
        &self,
        auction_id: &AuctionId,
    ) -> Result<responses::MyBid, ClientError> {
        let response =
            self.get(&format!("auction/{auction_id}/my_bid")).await?;
        ok_body(response).await
    }

    pub async fn get_balance(
        &self,
    ) -> Result<responses::UserBalance, ClientError> {
        let response = self.get("balance").await?;
        ok_body(response).await
    }

    pub async fn get_transactions(
        &self,
        limit: i64,
    ) -> Result<Vec<responses::Transaction>, ClientError> {
        let response = self.get(&format!("transactions?limit={limit}")).await?;
        ok_body(response).await
    }

    /// Only available against servers built with the `test-ops` feature.
    pub async fn mint(
        &self,
        details: &requests::Mint,
    ) -> Result<responses::UserBalance, ClientError> {
        let response = self.post("mint", details, None).await?;
        ok_body(response).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// An unhandled API error to display, containing response text.
    #[error("{1}")]
    APIError(StatusCode, String),
    #[error("Network error. Please check your connection.")]
    Network(#[from] reqwest::Error),
}

impl ClientError {
    /// The machine-readable code of an API error body, when present.
    pub fn error_code(&self) -> Option<responses::ErrorCode> {
        match self {
            ClientError::APIError(_, body) => {
                serde_json::from_str::<responses::ErrorBody>(body)
                    .ok()
                    .map(|b| b.error)
            }
            ClientError::Network(_) => None,
        }
    }
}

/// Deserialize a successful request into the desired type, or return an
/// appropriate error.
pub async fn ok_body<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, ClientError> {
    if !response.status().is_success() {
        return Err(ClientError::APIError(
            response.status(),
            response.text().await?,
        ));
    }
    Ok(response.json::<T>().await?)
}

/// Check that an empty response is OK, returning a ClientError if not.
pub async fn ok_empty(response: reqwest::Response) -> Result<(), ClientError> {
    if !response.status().is_success() {
        return Err(ClientError::APIError(
            response.status(),
            response.text().await?,
        ));
    }
    Ok(())
}
