use std::{
    collections::HashSet,
    fmt,
};

use crate::{
    Result,
    config::SyncConfig,
    entity::{
        Address,
        RaffleEntity,
        RaffleStatus,
    },
    error::IndexerError,
    feed::{
        RaffleFeed,
        UserRaffleSource,
        UserRaffles,
    },
};
use serde::{
    Deserialize,
    de::DeserializeOwned,
};
use serde_json::json;
use tracing::{
    debug,
    warn,
};
use url::Url;

const RAFFLE_FIELDS: &str = r#"
fragment RaffleFields on Raffle {
  id
  name
  status
  ticketPrice
  prizePool
  ticketsSold
  minTickets
  maxTickets
  deadline
  creator
  completedAt
  canceledAt
  cancellationReason
  lastUpdatedAt
}
"#;

const ALL_RAFFLES_QUERY: &str = r#"
query AllRaffles($first: Int!) {
  raffles(first: $first, orderBy: lastUpdatedAt, orderDirection: desc) {
    ...RaffleFields
  }
}
"#;

const USER_RAFFLES_QUERY: &str = r#"
query UserRaffles($user: Bytes!, $first: Int!) {
  created: raffles(
    first: $first
    where: { creator: $user }
    orderBy: lastUpdatedAt
    orderDirection: desc
  ) {
    ...RaffleFields
  }
  participated: ticketPurchases(
    first: $first
    where: { buyer: $user }
    orderBy: timestamp
    orderDirection: desc
  ) {
    raffle {
      ...RaffleFields
    }
  }
}
"#;

/// GraphQL client for the raffle subgraph.
#[derive(Clone)]
pub struct IndexerClient {
    endpoint: Url,
    http: reqwest::Client,
}

impl IndexerClient {
    pub fn new(endpoint: Url) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(IndexerError::Transport)?;
        Ok(Self { endpoint, http })
    }

    /// Fails with a configuration error when the endpoint is not set.
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        Self::new(config.indexer_url()?)
    }

    pub async fn all_raffles(&self, limit: usize) -> Result<Vec<RaffleEntity>> {
        let data: AllRafflesData = self
            .query(ALL_RAFFLES_QUERY, json!({ "first": limit }))
            .await?;
        Ok(ingest(data.raffles))
    }

    pub async fn user_raffles(&self, user: &Address, limit: usize) -> Result<UserRaffles> {
        let data: UserRafflesData = self
            .query(
                USER_RAFFLES_QUERY,
                json!({ "user": user.as_str(), "first": limit }),
            )
            .await?;
        let created = ingest(data.created);

        // One purchase per ticket batch, so the same raffle shows up repeatedly.
        let mut seen = HashSet::new();
        let participated = ingest(
            data.participated
                .into_iter()
                .map(|purchase| purchase.raffle)
                .filter(|raffle| seen.insert(raffle.id.to_ascii_lowercase())),
        );
        debug!(
            %user,
            created = created.len(),
            participated = participated.len(),
            "fetched user raffles"
        );
        Ok(UserRaffles {
            created,
            participated,
        })
    }

    async fn query<D: DeserializeOwned>(
        &self,
        query: &str,
        variables: serde_json::Value,
    ) -> Result<D> {
        let body = json!({
            "query": format!("{query}{RAFFLE_FIELDS}"),
            "variables": variables,
        });
        let res = self
            .http
            .post(self.endpoint.clone())
            .json(&body)
            .send()
            .await
            .map_err(IndexerError::Transport)?;
        let status = res.status();
        let bytes = res.bytes().await.map_err(IndexerError::Transport)?;
        if !status.is_success() {
            return Err(IndexerError::Http {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            }
            .into());
        }
        Ok(decode_response(&bytes)?)
    }
}

impl RaffleFeed for IndexerClient {
    async fn fetch_raffles(&self, limit: usize) -> Result<Vec<RaffleEntity>> {
        self.all_raffles(limit).await
    }
}

impl UserRaffleSource for IndexerClient {
    async fn user_raffles(&self, user: &Address, limit: usize) -> Result<UserRaffles> {
        IndexerClient::user_raffles(self, user, limit).await
    }
}

impl fmt::Display for IndexerClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.endpoint)
    }
}

#[derive(Deserialize)]
struct GraphQlResponse<D> {
    data: Option<D>,
    #[serde(default)]
    errors: Vec<GraphQlErrorDto>,
}

#[derive(Deserialize)]
struct GraphQlErrorDto {
    message: String,
}

fn decode_response<D: DeserializeOwned>(bytes: &[u8]) -> Result<D, IndexerError> {
    let response: GraphQlResponse<D> = serde_json::from_slice(bytes)
        .map_err(|err| IndexerError::Decode(err.to_string()))?;
    if !response.errors.is_empty() {
        return Err(IndexerError::Query {
            messages: response.errors.into_iter().map(|e| e.message).collect(),
        });
    }
    response
        .data
        .ok_or_else(|| IndexerError::Decode("response carries no data".to_string()))
}

fn ingest(records: impl IntoIterator<Item = RaffleDto>) -> Vec<RaffleEntity> {
    records
        .into_iter()
        .filter_map(|dto| {
            let id = dto.id.clone();
            match RaffleEntity::try_from(dto) {
                Ok(entity) => Some(entity),
                Err(err) => {
                    warn!(raffle = %id, %err, "skipping malformed raffle record");
                    None
                }
            }
        })
        .collect()
}

#[derive(Deserialize, Debug)]
struct AllRafflesData {
    raffles: Vec<RaffleDto>,
}

#[derive(Deserialize)]
struct UserRafflesData {
    #[serde(default)]
    created: Vec<RaffleDto>,
    #[serde(default)]
    participated: Vec<TicketPurchaseDto>,
}

#[derive(Deserialize)]
struct TicketPurchaseDto {
    raffle: RaffleDto,
}

/// Subgraphs serialize big integers as strings and small ones as numbers,
/// depending on the schema type.
#[derive(Deserialize, Clone, Debug)]
#[serde(untagged)]
enum NumberDto {
    Int(u64),
    Text(String),
}

impl NumberDto {
    fn to_u128(&self, field: &str) -> Result<u128, IndexerError> {
        match self {
            NumberDto::Int(value) => Ok(u128::from(*value)),
            NumberDto::Text(raw) => raw.trim().parse().map_err(|_| {
                IndexerError::Decode(format!("{field}: `{raw}` is not an unsigned integer"))
            }),
        }
    }

    fn to_u64(&self, field: &str) -> Result<u64, IndexerError> {
        u64::try_from(self.to_u128(field)?)
            .map_err(|_| IndexerError::Decode(format!("{field}: out of range")))
    }

    fn to_i64(&self, field: &str) -> Result<i64, IndexerError> {
        i64::try_from(self.to_u128(field)?)
            .map_err(|_| IndexerError::Decode(format!("{field}: out of range")))
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
struct RaffleDto {
    id: String,
    name: Option<String>,
    status: String,
    ticket_price: Option<NumberDto>,
    prize_pool: Option<NumberDto>,
    tickets_sold: Option<NumberDto>,
    min_tickets: Option<NumberDto>,
    max_tickets: Option<NumberDto>,
    deadline: Option<NumberDto>,
    creator: Option<String>,
    completed_at: Option<NumberDto>,
    canceled_at: Option<NumberDto>,
    cancellation_reason: Option<String>,
    last_updated_at: Option<NumberDto>,
}

fn opt<T>(
    value: Option<&NumberDto>,
    field: &str,
    convert: impl Fn(&NumberDto, &str) -> Result<T, IndexerError>,
) -> Result<Option<T>, IndexerError> {
    value.map(|v| convert(v, field)).transpose()
}

impl TryFrom<RaffleDto> for RaffleEntity {
    type Error = IndexerError;

    fn try_from(dto: RaffleDto) -> Result<Self, Self::Error> {
        let id = Address::new(&dto.id);
        if !id.is_valid() {
            return Err(IndexerError::Decode(format!("invalid raffle id `{}`", dto.id)));
        }
        let status = dto
            .status
            .parse::<RaffleStatus>()
            .map_err(IndexerError::Decode)?;
        let completed_at =
            opt(dto.completed_at.as_ref(), "completedAt", NumberDto::to_i64)?.filter(|t| *t > 0);
        let canceled_at =
            opt(dto.canceled_at.as_ref(), "canceledAt", NumberDto::to_i64)?.filter(|t| *t > 0);
        let last_updated = opt(dto.last_updated_at.as_ref(), "lastUpdatedAt", NumberDto::to_i64)?
            .or(completed_at)
            .or(canceled_at)
            .unwrap_or_default();

        Ok(RaffleEntity {
            id,
            name: dto.name.unwrap_or_default(),
            status,
            ticket_price: opt(dto.ticket_price.as_ref(), "ticketPrice", NumberDto::to_u128)?
                .unwrap_or_default(),
            prize_pool: opt(dto.prize_pool.as_ref(), "prizePool", NumberDto::to_u128)?
                .unwrap_or_default(),
            tickets_sold: opt(dto.tickets_sold.as_ref(), "ticketsSold", NumberDto::to_u64)?
                .unwrap_or_default(),
            min_tickets: opt(dto.min_tickets.as_ref(), "minTickets", NumberDto::to_u64)?
                .unwrap_or_default(),
            max_tickets: opt(dto.max_tickets.as_ref(), "maxTickets", NumberDto::to_u64)?
                .filter(|max| *max > 0),
            deadline: opt(dto.deadline.as_ref(), "deadline", NumberDto::to_i64)?
                .unwrap_or_default(),
            creator: dto.creator.map(Address::new).unwrap_or_default(),
            completed_at,
            canceled_at,
            cancellation_reason: dto.cancellation_reason.filter(|r| !r.is_empty()),
            last_updated,
        })
    }
}

#[allow(non_snake_case)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::address;

    fn dto(value: serde_json::Value) -> RaffleDto {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn try_from__mixed_number_encodings__are_normalized() {
        // given
        let record = dto(json!({
            "id": "0x00000000000000000000000000000000000000AA",
            "name": "Summer",
            "status": "OPEN",
            "ticketPrice": "1000000",
            "prizePool": "340282366920938463463374607431768211455",
            "ticketsSold": 12,
            "minTickets": "10",
            "maxTickets": "0",
            "deadline": 1_700_000_000,
            "creator": "0x00000000000000000000000000000000000000BB",
            "lastUpdatedAt": "1700000100"
        }));

        // when
        let entity = RaffleEntity::try_from(record).unwrap();

        // then
        assert_eq!(entity.id, address(0xaa));
        assert_eq!(entity.creator, address(0xbb));
        assert_eq!(entity.prize_pool, u128::MAX);
        assert_eq!(entity.tickets_sold, 12);
        assert_eq!(entity.max_tickets, None);
        assert_eq!(entity.deadline, 1_700_000_000);
        assert_eq!(entity.last_updated, 1_700_000_100);
    }

    #[test]
    fn try_from__missing_optional_fields__get_defaults() {
        // given
        let record = dto(json!({
            "id": "0x00000000000000000000000000000000000000aa",
            "status": "CANCELED",
            "canceledAt": "42"
        }));

        // when
        let entity = RaffleEntity::try_from(record).unwrap();

        // then
        assert_eq!(entity.name, "");
        assert_eq!(entity.ticket_price, 0);
        assert_eq!(entity.canceled_at, Some(42));
        assert_eq!(entity.last_updated, 42);
        assert_eq!(entity.creator, Address::default());
    }

    #[test]
    fn try_from__garbage_number__is_rejected() {
        let record = dto(json!({
            "id": "0x00000000000000000000000000000000000000aa",
            "status": "OPEN",
            "ticketPrice": "lots"
        }));
        assert!(RaffleEntity::try_from(record).is_err());
    }

    #[test]
    fn ingest__skips_bad_records_and_keeps_the_rest() {
        // given
        let records = vec![
            dto(json!({ "id": "0x00000000000000000000000000000000000000aa", "status": "OPEN" })),
            dto(json!({ "id": "not-an-address", "status": "OPEN" })),
            dto(json!({ "id": "0x00000000000000000000000000000000000000bb", "status": "PAUSED" })),
        ];

        // when
        let entities = ingest(records);

        // then
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].id, address(0xaa));
    }

    #[test]
    fn decode_response__errors_list__is_a_query_failure() {
        // given
        let body = br#"{"data":null,"errors":[{"message":"Type `Raffle` has no field `foo`"}]}"#;

        // when
        let err = decode_response::<AllRafflesData>(body).unwrap_err();

        // then
        match err {
            IndexerError::Query { messages } => {
                assert_eq!(messages, vec!["Type `Raffle` has no field `foo`"]);
            }
            other => panic!("expected query error, got {other:?}"),
        }
    }

    #[test]
    fn decode_response__participated_purchases__flatten_to_raffles() {
        // given
        let body = json!({
            "data": {
                "created": [],
                "participated": [
                    { "raffle": {
                        "id": "0x00000000000000000000000000000000000000aa",
                        "status": "OPEN",
                    } }
                ]
            }
        })
        .to_string();

        // when
        let data = decode_response::<UserRafflesData>(body.as_bytes()).unwrap();

        // then
        assert!(data.created.is_empty());
        assert_eq!(data.participated.len(), 1);
    }
}
