//! Contract lifecycle on top of a [`Processor`] and a [`Host`].
//!
//! These helpers perform no rollback of their own beyond removing the code of
//! a contract whose constructor failed. Callers that need atomicity run them
//! against a snapshot of their host (see [`OverlayState`](super::state::OverlayState)).

use crate::info;
use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::host::Host;
use crate::virtual_machine::program::{
    ContractID, METHOD_CTOR, METHOD_DTOR, Module, contract_id,
};
use crate::virtual_machine::state::VarKey;
use crate::virtual_machine::vm::Processor;

/// Stores `code` as a new contract and runs its constructor with `args`.
pub fn deploy<H: Host + ?Sized>(
    processor: &mut Processor,
    host: &mut H,
    code: &[u8],
    args: &[u8],
) -> Result<ContractID, VMError> {
    Module::load(code)?;
    let cid = contract_id(code, args);
    let key = VarKey::code(&cid);
    if host.load_var(&key).is_some() {
        return Err(VMError::ContractExists { cid });
    }
    host.save_var(&key, code);
    if let Err(err) = processor.invoke(host, &cid, METHOD_CTOR, args) {
        host.save_var(&key, &[]);
        return Err(err);
    }
    info!("deployed contract {cid} ({} bytes)", code.len());
    Ok(cid)
}

/// Runs `method` of `cid` and returns the argument block as the method left it.
pub fn invoke<H: Host + ?Sized>(
    processor: &mut Processor,
    host: &mut H,
    cid: &ContractID,
    method: u16,
    args: &[u8],
) -> Result<Vec<u8>, VMError> {
    processor.invoke(host, cid, method, args)
}

/// Runs the destructor of `cid`, then removes its code.
pub fn destroy<H: Host + ?Sized>(
    processor: &mut Processor,
    host: &mut H,
    cid: &ContractID,
    args: &[u8],
) -> Result<(), VMError> {
    processor.invoke(host, cid, METHOD_DTOR, args)?;
    host.save_var(&VarKey::code(cid), &[]);
    info!("destroyed contract {cid}");
    Ok(())
}
