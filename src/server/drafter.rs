//! Scoped order item processor
//!
//! Order fan-out resolves an [`ItemDrafter`] from each item's scope, so every
//! item sees its own instance. The drafter is the seam where an external
//! content service would be called.

use crate::scope::ServiceCollection;
use anyhow::bail;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;

/// Produces the draft for one order item
#[derive(Debug, Default)]
pub struct ItemDrafter {
    drafted: AtomicUsize,
}

impl ItemDrafter {
    /// Draft `item`
    ///
    /// # Errors
    ///
    /// Fails for blank items and when `cancel` has fired.
    pub async fn draft(&self, item: &str, cancel: &CancellationToken) -> anyhow::Result<String> {
        if cancel.is_cancelled() {
            bail!("cancelled before drafting {}", item);
        }
        let item = item.trim();
        if item.is_empty() {
            bail!("order item is blank");
        }

        tokio::task::yield_now().await;
        self.drafted.fetch_add(1, Ordering::Relaxed);
        Ok(format!("draft: {}", item))
    }

    /// Number of items drafted by this instance
    pub fn drafted(&self) -> usize {
        self.drafted.load(Ordering::Relaxed)
    }
}

/// Services registered by the server
pub fn default_services() -> ServiceCollection {
    ServiceCollection::new().add_scoped(|_| Ok(ItemDrafter::default()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_draft_trims_and_counts() {
        let drafter = ItemDrafter::default();
        let draft = drafter
            .draft("  lemon tart ", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(draft, "draft: lemon tart");
        assert_eq!(drafter.drafted(), 1);
    }

    #[tokio::test]
    async fn test_draft_rejects_blank_and_cancelled() {
        let drafter = ItemDrafter::default();
        assert!(drafter.draft("   ", &CancellationToken::new()).await.is_err());

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(drafter.draft("soup", &cancel).await.is_err());
        assert_eq!(drafter.drafted(), 0);
    }

    #[test]
    fn test_default_services_scope_drafters() {
        let provider = default_services().build();
        let first = provider.create_scope();
        let second = provider.create_scope();
        let a = first.get_service::<ItemDrafter>().unwrap();
        let b = first.get_service::<ItemDrafter>().unwrap();
        let c = second.get_service::<ItemDrafter>().unwrap();
        assert!(std::sync::Arc::ptr_eq(&a, &b));
        assert!(!std::sync::Arc::ptr_eq(&a, &c));
    }
}
