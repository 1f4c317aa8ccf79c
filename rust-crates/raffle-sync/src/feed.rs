use crate::{
    Result,
    entity::{
        Address,
        RaffleEntity,
    },
};
use std::sync::Arc;

/// Anything that can list raffles, newest first where it can tell.
pub trait RaffleFeed: Send + Sync {
    fn fetch_raffles(
        &self,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<RaffleEntity>>> + Send;
}

impl<F: RaffleFeed> RaffleFeed for Arc<F> {
    fn fetch_raffles(
        &self,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<RaffleEntity>>> + Send {
        (**self).fetch_raffles(limit)
    }
}

/// Raffles a single user is attached to, as the indexer sees them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserRaffles {
    pub created: Vec<RaffleEntity>,
    pub participated: Vec<RaffleEntity>,
}

pub trait UserRaffleSource: Send + Sync {
    fn user_raffles(
        &self,
        user: &Address,
        limit: usize,
    ) -> impl Future<Output = Result<UserRaffles>> + Send;
}

impl<S: UserRaffleSource> UserRaffleSource for Arc<S> {
    fn user_raffles(
        &self,
        user: &Address,
        limit: usize,
    ) -> impl Future<Output = Result<UserRaffles>> + Send {
        (**self).user_raffles(user, limit)
    }
}
