use super::{TranslationContext, Type};
use crate::errors::{LinkageError, Result, VerifyErrorKind};
use std::collections::HashMap;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ProxyId(pub u32);

/// What we know about the object created by a `new`
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProxyState<'g> {
    /// Referenced (eg. from a stack map) but the `new` has not been decoded yet
    Provisional(ProxyId),

    /// The `new` was decoded, so the class being instantiated is known
    Resolved(Type<'g>),
}

/// Per-method side table of uninitialized object placeholders, keyed by the address of the `new`
pub struct ProxyTable<'g> {
    by_address: HashMap<u16, Type<'g>>,
    states: Vec<ProxyState<'g>>,
}

impl<'g> ProxyTable<'g> {
    pub fn new() -> ProxyTable<'g> {
        ProxyTable {
            by_address: HashMap::new(),
            states: vec![],
        }
    }

    /// Get (or create) the placeholder type for the `new` at an address
    pub fn proxy_for(&mut self, ctx: &TranslationContext<'g>, address: u16) -> Type<'g> {
        if let Some(proxy) = self.by_address.get(&address) {
            return proxy;
        }
        let id = ProxyId(self.states.len() as u32);
        self.states.push(ProxyState::Provisional(id));
        let proxy = ctx.new_proxy_type(id, address);
        self.by_address.insert(address, proxy);
        proxy
    }

    pub fn get(&self, address: u16) -> Option<Type<'g>> {
        self.by_address.get(&address).copied()
    }

    pub fn state(&self, proxy: Type<'g>) -> Option<ProxyState<'g>> {
        proxy
            .proxy_id()
            .and_then(|id| self.states.get(id.0 as usize).copied())
    }

    /// Record the class that the `new` creates
    ///
    /// Binding twice is fine so long as the class is the same.
    pub fn bind(&mut self, proxy: Type<'g>, real: Type<'g>) -> Result<()> {
        let id = match proxy.proxy_id() {
            Some(id) => id,
            None => return Err(LinkageError::verify(VerifyErrorKind::ExpectNew, "").into()),
        };
        match self.states.get_mut(id.0 as usize) {
            Some(state @ ProxyState::Provisional(_)) => {
                *state = ProxyState::Resolved(real);
                Ok(())
            }
            Some(ProxyState::Resolved(bound)) if *bound == real => Ok(()),
            _ => Err(LinkageError::verify(
                VerifyErrorKind::BadStackMap,
                format!("uninitialized object rebound to {}", real),
            )
            .into()),
        }
    }

    /// Real type of a placeholder, if known
    pub fn resolved(&self, proxy: Type<'g>) -> Option<Type<'g>> {
        match self.state(proxy) {
            Some(ProxyState::Resolved(ty)) => Some(ty),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

impl<'g> Default for ProxyTable<'g> {
    fn default() -> Self {
        ProxyTable::new()
    }
}
