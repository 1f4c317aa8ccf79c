use serde::{
    Deserialize,
    Serialize,
};
use std::{
    collections::BTreeMap,
    fmt,
    ops::{
        BitOr,
        BitOrAssign,
    },
    str::FromStr,
};

/// Hex digits in a ledger address, after the `0x` prefix.
pub const ADDRESS_HEX_LEN: usize = 40;

/// Delay after a raffle's deadline before its creator may use the hatch on a
/// draw that never completed.
pub const HATCH_DELAY_SECS: i64 = 24 * 60 * 60;

/// A ledger address, lowercased on construction so it can be used as an
/// identity key directly.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().trim().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `0x` followed by exactly 40 hex digits.
    pub fn is_valid(&self) -> bool {
        let Some(body) = self.0.strip_prefix("0x") else {
            return false;
        };
        body.len() == ADDRESS_HEX_LEN && hex::decode(body).is_ok()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RaffleStatus {
    FundingPending,
    Open,
    Drawing,
    Completed,
    Canceled,
}

impl RaffleStatus {
    /// Maps the ledger's on-chain enum ordinal.
    pub fn from_ledger_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(RaffleStatus::FundingPending),
            1 => Some(RaffleStatus::Open),
            2 => Some(RaffleStatus::Drawing),
            3 => Some(RaffleStatus::Completed),
            4 => Some(RaffleStatus::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RaffleStatus::Completed | RaffleStatus::Canceled)
    }
}

impl FromStr for RaffleStatus {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "FUNDING_PENDING" => Ok(RaffleStatus::FundingPending),
            "OPEN" => Ok(RaffleStatus::Open),
            "DRAWING" => Ok(RaffleStatus::Drawing),
            "COMPLETED" => Ok(RaffleStatus::Completed),
            "CANCELED" | "CANCELLED" => Ok(RaffleStatus::Canceled),
            other => Err(format!("unknown raffle status `{other}`")),
        }
    }
}

impl fmt::Display for RaffleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RaffleStatus::FundingPending => "FUNDING_PENDING",
            RaffleStatus::Open => "OPEN",
            RaffleStatus::Drawing => "DRAWING",
            RaffleStatus::Completed => "COMPLETED",
            RaffleStatus::Canceled => "CANCELED",
        };
        f.write_str(label)
    }
}

/// One raffle as reported by a single fetch. Amounts are base units of the
/// ticket asset; timestamps are unix seconds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RaffleEntity {
    pub id: Address,
    pub name: String,
    pub status: RaffleStatus,
    pub ticket_price: u128,
    pub prize_pool: u128,
    pub tickets_sold: u64,
    pub min_tickets: u64,
    /// `None` means the raffle has no ticket cap.
    pub max_tickets: Option<u64>,
    pub deadline: i64,
    pub creator: Address,
    pub completed_at: Option<i64>,
    pub canceled_at: Option<i64>,
    pub cancellation_reason: Option<String>,
    /// Recency key used for ordering.
    pub last_updated: i64,
}

impl RaffleEntity {
    pub fn tickets_remaining(&self) -> Option<u64> {
        self.max_tickets
            .map(|max| max.saturating_sub(self.tickets_sold))
    }

    pub fn minimum_reached(&self) -> bool {
        self.tickets_sold >= self.min_tickets
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.deadline
    }

    /// Hatch opens for the creator once a draw has been pending for
    /// [`HATCH_DELAY_SECS`] past the deadline.
    pub fn hatch_open(&self, now: i64) -> bool {
        self.status == RaffleStatus::Drawing
            && now >= self.deadline.saturating_add(HATCH_DELAY_SECS)
    }
}

/// Which way a user is attached to a raffle. Both flags may be set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub struct RoleTag {
    pub created: bool,
    pub participated: bool,
}

impl RoleTag {
    pub const CREATED: RoleTag = RoleTag {
        created: true,
        participated: false,
    };
    pub const PARTICIPATED: RoleTag = RoleTag {
        created: false,
        participated: true,
    };
}

impl BitOr for RoleTag {
    type Output = RoleTag;

    fn bitor(self, rhs: RoleTag) -> RoleTag {
        RoleTag {
            created: self.created || rhs.created,
            participated: self.participated || rhs.participated,
        }
    }
}

impl BitOrAssign for RoleTag {
    fn bitor_assign(&mut self, rhs: RoleTag) {
        *self = *self | rhs;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    /// Ticket and prize currency.
    Usdc,
    /// The chain's gas token (e.g. leftover randomness fees).
    Native,
}

impl AssetKind {
    pub const ALL: [AssetKind; 2] = [AssetKind::Usdc, AssetKind::Native];
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssetKind::Usdc => f.write_str("USDC"),
            AssetKind::Native => f.write_str("native"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ClaimAction {
    ClaimPrize,
    WithdrawProceeds,
    ClaimNative,
    Refund,
    Hatch,
}

/// A raffle with the user's claimable balances attached.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ClaimableEntry {
    pub entity: RaffleEntity,
    pub roles: RoleTag,
    /// Base-unit integers kept as decimal strings.
    pub claimable: BTreeMap<AssetKind, String>,
    pub is_creator: bool,
    pub read_errors: Vec<String>,
}

impl ClaimableEntry {
    /// Unread or unparsable amounts count as zero.
    pub fn amount(&self, asset: AssetKind) -> u128 {
        self.claimable
            .get(&asset)
            .and_then(|raw| raw.parse::<u128>().ok())
            .unwrap_or_default()
    }

    pub fn has_positive_amount(&self) -> bool {
        AssetKind::ALL.iter().any(|asset| self.amount(*asset) > 0)
    }

    pub fn available_actions(&self, now: i64) -> Vec<ClaimAction> {
        let mut actions = Vec::new();
        let usdc = self.amount(AssetKind::Usdc);
        if usdc > 0 {
            if self.is_creator && !self.roles.participated {
                actions.push(ClaimAction::WithdrawProceeds);
            } else {
                actions.push(ClaimAction::ClaimPrize);
            }
        }
        if self.amount(AssetKind::Native) > 0 {
            actions.push(ClaimAction::ClaimNative);
        }
        if self.roles.participated && self.entity.status == RaffleStatus::Canceled {
            actions.push(ClaimAction::Refund);
        }
        if self.is_creator && self.entity.hatch_open(now) {
            actions.push(ClaimAction::Hatch);
        }
        actions
    }
}
