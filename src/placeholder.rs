//! Swapping a stand-in visual for the real model once it resolves.
//!
//! The spawning layer owns the entity and implements [SpawnTarget] for it; a [PlaceholderUpgrade] drives it through
//! these states:
//!
//! ```text
//! NoModel --(template already parsed)--> Upgraded
//! NoModel --> Placeholder --> Upgraded
//!                         \-> Failed
//! ```
//!
//! Entities can go away while a model is in flight.  The target is checked again after every wait, and an upgrade
//! whose entity is gone is abandoned without touching it.  A failed upgrade leaves the stand-in in place; nothing
//! retries it.
use crate::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpgradeState {
    NoModel,
    Placeholder,
    Upgraded,
    Failed,
}

/// Vertical extents and horizontal radius of a model, in its own space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Extents {
    pub min_y: f32,
    pub max_y: f32,
    pub radius: f32,
}

impl Extents {
    pub fn height(&self) -> f32 {
        self.max_y - self.min_y
    }
}

/// Models which can report how big they are.
pub trait ModelBounds {
    fn extents(&self) -> Extents;
}

/// An entity waiting on a model.
pub trait SpawnTarget<M>: Send + Sync {
    /// Whether the entity still exists and is attached to the scene.
    fn is_alive(&self) -> bool;

    fn show_placeholder(&self);

    /// Replace whatever the entity currently shows with `model`, in place.
    fn install_model(&self, model: M);

    /// Height of the surface the entity rests on.
    fn support_height(&self) -> f32;

    fn set_vertical_offset(&self, offset: f32);

    /// Resize anything scaled to the entity, such as shadows or selection rings.
    fn resize_accessories(&self, extents: &Extents);
}

pub struct PlaceholderUpgrade<T> {
    key: CacheKey,
    target: T,
    state: UpgradeState,
}

impl<T> PlaceholderUpgrade<T> {
    pub fn new(key: CacheKey, target: T) -> PlaceholderUpgrade<T> {
        PlaceholderUpgrade {
            key,
            target,
            state: UpgradeState::NoModel,
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn state(&self) -> UpgradeState {
        self.state
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    /// Drive the upgrade to its end, returning the state it ended in.
    ///
    /// An abandoned upgrade stays in whatever state it was in when its entity went away.
    pub async fn run<L>(&mut self, resolver: &Resolver<L>, priority: i32) -> UpgradeState
    where
        L: ModelLoader,
        L::Model: ModelBounds,
        T: SpawnTarget<L::Model>,
    {
        if !self.target.is_alive() || self.state != UpgradeState::NoModel {
            return self.state;
        }

        // A parsed template is one cheap clone away; skip the stand-in entirely.
        if !resolver.has_cached_template(&self.key) {
            self.target.show_placeholder();
            self.state = UpgradeState::Placeholder;
        }

        let result = resolver.get_model_instance(&self.key, priority).await;
        if !self.target.is_alive() {
            tracing::debug!(key = %self.key, "Entity went away before its model arrived");
            return self.state;
        }

        match result {
            Ok(model) => {
                let extents = model.extents();
                self.target.install_model(model);
                // Put the lowest point of the model on the supporting surface.
                self.target
                    .set_vertical_offset(self.target.support_height() - extents.min_y);
                self.target.resize_accessories(&extents);
                self.state = UpgradeState::Upgraded;
            }
            Err(e) => {
                tracing::warn!(key = %self.key, "Keeping placeholder: {}", e);
                self.state = UpgradeState::Failed;
            }
        }
        self.state
    }
}

impl<T: Send + 'static> PlaceholderUpgrade<T> {
    /// Run the upgrade on the resolver's runtime.
    pub fn spawn<L>(mut self, resolver: Resolver<L>, priority: i32) -> tokio::task::JoinHandle<PlaceholderUpgrade<T>>
    where
        L: ModelLoader,
        L::Model: ModelBounds,
        T: SpawnTarget<L::Model>,
    {
        let runtime = resolver.runtime().clone();
        runtime.spawn(async move {
            self.run(&resolver, priority).await;
            self
        })
    }
}
