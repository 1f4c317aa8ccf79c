use crate::entity::{
    Address,
    RaffleEntity,
    RoleTag,
};
use std::collections::HashMap;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaggedRaffle {
    pub entity: RaffleEntity,
    pub roles: RoleTag,
}

/// Combines the raffles a user created with those they bought tickets in.
///
/// Entries are keyed by address; a raffle present in both lists appears once
/// with both roles set, carrying whichever snapshot was updated most recently.
/// Output is sorted by `last_updated` descending; ties keep input order with
/// `created` ahead of `participated`.
pub fn merge(created: Vec<RaffleEntity>, participated: Vec<RaffleEntity>) -> Vec<TaggedRaffle> {
    let mut index: HashMap<Address, usize> = HashMap::new();
    let mut merged: Vec<TaggedRaffle> = Vec::with_capacity(created.len() + participated.len());

    let tagged = created
        .into_iter()
        .map(|entity| (entity, RoleTag::CREATED))
        .chain(participated.into_iter().map(|entity| (entity, RoleTag::PARTICIPATED)));
    for (entity, role) in tagged {
        match index.get(&entity.id) {
            Some(&slot) => {
                let existing = &mut merged[slot];
                existing.roles |= role;
                if entity.last_updated > existing.entity.last_updated {
                    existing.entity = entity;
                }
            }
            None => {
                index.insert(entity.id.clone(), merged.len());
                merged.push(TaggedRaffle {
                    entity,
                    roles: role,
                });
            }
        }
    }

    // `sort_by` is stable, which is what keeps ties in input order.
    merged.sort_by(|a, b| b.entity.last_updated.cmp(&a.entity.last_updated));
    merged
}
