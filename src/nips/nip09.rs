//! NIP-09 deletion requests. A kind-5 event is stored like any regular
//! event; its side effects run as a post-store hook.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::event::Event;
use crate::filter::Filter;
use crate::policy::NipModule;
use crate::store::EventStore;

pub const KIND_DELETION: u16 = 5;

pub struct Nip09;

#[async_trait]
impl NipModule for Nip09 {
    fn name(&self) -> &'static str {
        "nip09"
    }

    fn nips(&self) -> &'static [u16] {
        &[9]
    }

    async fn post_store(&self, event: &Event, store: &EventStore) -> Result<(), StoreError> {
        if event.kind != KIND_DELETION {
            return Ok(());
        }

        for target_id in event.tag_values("e") {
            delete_by_id(store, target_id, &event.pubkey).await?;
        }
        for address in event.tag_values("a") {
            delete_by_address(store, address, &event.pubkey).await?;
        }
        Ok(())
    }
}

/// Delete the referenced event if it exists, belongs to the requesting
/// author, and is not itself a deletion request.
async fn delete_by_id(store: &EventStore, id: &str, author: &str) -> Result<(), StoreError> {
    let Some(target) = store.get(id).await? else {
        return Ok(());
    };
    if target.pubkey != author || target.kind == KIND_DELETION {
        return Ok(());
    }
    store.delete(id).await?;
    store.mark_deleted(id).await?;
    tracing::debug!(%id, "deleted event on author request");
    Ok(())
}

/// `a` tags address `<kind>:<pubkey>:<d-tag>`; the d-tag may itself
/// contain colons, so split at most twice.
async fn delete_by_address(
    store: &EventStore,
    address: &str,
    author: &str,
) -> Result<(), StoreError> {
    let mut parts = address.splitn(3, ':');
    let (Some(kind_raw), Some(pubkey), d_tag) = (parts.next(), parts.next(), parts.next()) else {
        return Ok(());
    };
    let Ok(kind) = kind_raw.parse::<u16>() else {
        return Ok(());
    };
    if pubkey != author {
        return Ok(());
    }
    let d_tag = d_tag.unwrap_or("");

    // A slot with no d tag keys on the empty string, which a `#d` filter
    // cannot express; fetch the author's events of that kind and compare
    // d tags directly.
    let mut filter = Filter::new();
    filter.authors = Some(vec![pubkey.to_string()]);
    filter.kinds = Some(vec![kind]);

    for target in store.query(std::slice::from_ref(&filter)).await? {
        if target.d_tag() == d_tag {
            store.delete(&target.id).await?;
            store.mark_deleted(&target.id).await?;
            tracing::debug!(id = %target.id, %address, "deleted addressable event");
        }
    }
    Ok(())
}
