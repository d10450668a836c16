//! Extension points the processor calls back into.
//!
//! A [`Host`] is storage plus a set of authorization and custody hooks.
//! Every hook defaults to refusing the request, so a plain storage backend
//! is a valid host for contracts that never touch funds or assets.
//! Returning `false` aborts the invocation. A refused `asset_create`
//! returns asset id 0, which only clears the processor flag.

use crate::crypto::key_pair::PubKey;
use crate::types::hash::Hash;
use crate::virtual_machine::program::ContractID;
use crate::virtual_machine::state::{OverlayState, State};

/// Asset identifier; 0 denotes the native coin and never a created asset.
pub type AssetID = u32;

pub trait Host: State {
    /// Requires the invocation to be signed by `pk`.
    fn add_sig(&mut self, _pk: &PubKey) -> bool {
        false
    }

    /// Moves `amount` of asset `aid` from the transaction into `cid`'s custody.
    fn funds_lock(&mut self, _cid: &ContractID, _aid: AssetID, _amount: u64) -> bool {
        false
    }

    /// Releases `amount` of asset `aid` from `cid`'s custody.
    fn funds_unlock(&mut self, _cid: &ContractID, _aid: AssetID, _amount: u64) -> bool {
        false
    }

    /// Records that `cid` depends on `target`.
    fn ref_add(&mut self, _cid: &ContractID, _target: &ContractID) -> bool {
        false
    }

    fn ref_release(&mut self, _cid: &ContractID, _target: &ContractID) -> bool {
        false
    }

    /// Creates an asset owned by `owner`; returns its id, or 0 on failure.
    fn asset_create(&mut self, _cid: &ContractID, _metadata: &[u8], _owner: &Hash) -> AssetID {
        0
    }

    /// Mints (`burn == false`) or burns `amount` of asset `aid`.
    fn asset_emit(&mut self, _cid: &ContractID, _aid: AssetID, _amount: u64, _burn: bool) -> bool {
        false
    }

    fn asset_destroy(&mut self, _cid: &ContractID, _aid: AssetID) -> bool {
        false
    }
}

impl<S: State + ?Sized> Host for OverlayState<'_, S> {}
