//! Explicit resource-state machine.
//!
//! Every texture the renderer touches carries one of these states. A
//! transition not listed in `is_allowed` is a programming error and is
//! rejected before anything reaches the device.

use super::TextureId;
use crate::error::{PelageError, Result};
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ResourceState {
    Undefined,
    RenderTarget,
    ShaderReadable,
    ResolveSource,
    ResolveDestination,
    Presentable,
    CopyDestination,
    GenericRead,
}

impl ResourceState {
    pub fn is_allowed(from: ResourceState, to: ResourceState) -> bool {
        use ResourceState::*;
        match (from, to) {
            (Undefined, RenderTarget | CopyDestination | ShaderReadable | ResolveSource | Presentable | GenericRead) => {
                true
            }
            (RenderTarget, ShaderReadable | ResolveSource | Presentable) => true,
            (ShaderReadable, RenderTarget | CopyDestination) => true,
            (ResolveSource, RenderTarget) => true,
            (ResolveDestination, Presentable) => true,
            (Presentable, ResolveDestination | RenderTarget) => true,
            (CopyDestination, ShaderReadable | GenericRead) => true,
            (GenericRead, CopyDestination) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub texture: TextureId,
    pub from: ResourceState,
    pub to: ResourceState,
}

impl Transition {
    pub fn new(texture: TextureId, from: ResourceState, to: ResourceState) -> Self {
        Self { texture, from, to }
    }
}

#[derive(Debug, Clone)]
struct Tracked {
    name: String,
    state: ResourceState,
}

/// Current state of every registered texture.
#[derive(Debug, Clone, Default)]
pub struct ResourceTracker {
    resources: HashMap<TextureId, Tracked>,
}

impl ResourceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: TextureId, name: impl Into<String>, initial: ResourceState) {
        self.resources.insert(id, Tracked { name: name.into(), state: initial });
    }

    pub fn state(&self, id: TextureId) -> Result<ResourceState> {
        self.resources
            .get(&id)
            .map(|t| t.state)
            .ok_or_else(|| PelageError::UnknownResource(format!("{:?}", id)))
    }

    pub fn name(&self, id: TextureId) -> Option<&str> {
        self.resources.get(&id).map(|t| t.name.as_str())
    }

    /// Check a transition against the current state and the table, then apply it.
    pub fn apply(&mut self, t: &Transition) -> Result<()> {
        let tracked = self
            .resources
            .get_mut(&t.texture)
            .ok_or_else(|| PelageError::UnknownResource(format!("{:?}", t.texture)))?;
        if tracked.state != t.from {
            return Err(PelageError::StateMismatch {
                resource: tracked.name.clone(),
                expected: t.from,
                actual: tracked.state,
            });
        }
        if !ResourceState::is_allowed(t.from, t.to) {
            return Err(PelageError::InvalidTransition { resource: tracked.name.clone(), from: t.from, to: t.to });
        }
        tracked.state = t.to;
        Ok(())
    }

    /// Fails with `StateMismatch` unless `id` is currently in `expected`.
    pub fn require(&self, id: TextureId, expected: ResourceState) -> Result<()> {
        let actual = self.state(id)?;
        if actual != expected {
            return Err(PelageError::StateMismatch {
                resource: self.name(id).unwrap_or("?").to_string(),
                expected,
                actual,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ResourceState::*;

    const ALL: [ResourceState; 8] =
        [Undefined, RenderTarget, ShaderReadable, ResolveSource, ResolveDestination, Presentable, CopyDestination, GenericRead];

    #[test]
    fn frame_cycle_transitions_are_allowed() {
        for (from, to) in [
            (ShaderReadable, RenderTarget),
            (RenderTarget, ShaderReadable),
            (ResolveSource, RenderTarget),
            (RenderTarget, ResolveSource),
            (Presentable, ResolveDestination),
            (ResolveDestination, Presentable),
            (CopyDestination, ShaderReadable),
        ] {
            assert!(ResourceState::is_allowed(from, to), "{:?} -> {:?}", from, to);
        }
    }

    #[test]
    fn self_transitions_and_unlisted_pairs_are_rejected() {
        for s in ALL {
            assert!(!ResourceState::is_allowed(s, s));
            assert!(!ResourceState::is_allowed(s, Undefined));
        }
        assert!(!ResourceState::is_allowed(Presentable, CopyDestination));
        assert!(!ResourceState::is_allowed(ResolveDestination, RenderTarget));
        assert!(!ResourceState::is_allowed(ShaderReadable, ResolveSource));
    }

    #[test]
    fn tracker_checks_current_state() {
        let id = TextureId(3);
        let mut tr = ResourceTracker::new();
        tr.register(id, "msaa", ResolveSource);
        assert!(matches!(
            tr.apply(&Transition::new(id, RenderTarget, ResolveSource)),
            Err(PelageError::StateMismatch { .. })
        ));
        tr.apply(&Transition::new(id, ResolveSource, RenderTarget)).unwrap();
        assert_eq!(tr.state(id).unwrap(), RenderTarget);
        assert!(matches!(
            tr.apply(&Transition::new(id, RenderTarget, CopyDestination)),
            Err(PelageError::InvalidTransition { .. })
        ));
        // A rejected transition leaves the state alone.
        assert_eq!(tr.state(id).unwrap(), RenderTarget);
        assert!(tr.require(id, RenderTarget).is_ok());
        assert!(tr.require(id, ShaderReadable).is_err());
    }

    #[test]
    fn unknown_textures_are_reported() {
        let tr = ResourceTracker::new();
        assert!(matches!(tr.state(TextureId(9)), Err(PelageError::UnknownResource(_))));
    }
}
