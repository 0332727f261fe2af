//! On-demand relation loading.

use asupersync::{Cx, Outcome};

use crate::entity::EntityData;
use crate::error::Error;
use crate::metadata::{EntityMetadata, EntityProperty};
use crate::value::Value;

/// Fetches the targets of one relation property for one owner.
///
/// The returned rows are merged into the identity map by the caller; the
/// loader never touches managed instances itself.
pub trait RelationLoader: Send + Sync {
    fn load_relation(
        &self,
        cx: &Cx,
        owner: &EntityMetadata,
        owner_key: &[Value],
        property: &EntityProperty,
    ) -> impl Future<Output = Outcome<Vec<EntityData>, Error>> + Send;
}
