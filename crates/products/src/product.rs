use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use catalog_core::{Aggregate, DomainError, DomainResult, Entity, EntityId};
use catalog_events::{Event, EventEnvelope, EventKind};

/// Product identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductId(pub EntityId);

impl ProductId {
    pub fn new(id: EntityId) -> Self {
        Self(id)
    }

    /// Fresh time-ordered identifier.
    pub fn generate() -> Self {
        Self(EntityId::new())
    }
}

impl core::fmt::Display for ProductId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl core::str::FromStr for ProductId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Full product state at one point in time; the event payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductSnapshot {
    pub id: ProductId,
    pub name: String,
    pub description: Option<String>,
    pub price: f64,
    pub stock: i64,
}

/// Caller-supplied mutable fields of a product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductFields {
    pub name: String,
    pub description: Option<String>,
    pub price: f64,
    pub stock: i64,
}

impl ProductFields {
    /// Field constraints shared by create and update.
    pub fn validate(&self) -> DomainResult<()> {
        if self.name.trim().is_empty() {
            return Err(DomainError::validation("name cannot be empty"));
        }
        if !self.price.is_finite() {
            return Err(DomainError::validation("price must be a finite number"));
        }
        if self.price < 0.0 {
            return Err(DomainError::validation("price cannot be negative"));
        }
        if self.stock < 0 {
            return Err(DomainError::validation("stock cannot be negative"));
        }
        Ok(())
    }
}

/// Command: CreateProduct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateProduct {
    pub product_id: ProductId,
    pub fields: ProductFields,
    pub occurred_at: DateTime<Utc>,
}

/// Command: UpdateProduct (full replacement of the mutable fields).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateProduct {
    pub product_id: ProductId,
    pub fields: ProductFields,
    pub occurred_at: DateTime<Utc>,
}

/// Command: DeleteProduct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteProduct {
    pub product_id: ProductId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProductCommand {
    Create(CreateProduct),
    Update(UpdateProduct),
    Delete(DeleteProduct),
}

impl ProductCommand {
    pub fn product_id(&self) -> ProductId {
        match self {
            ProductCommand::Create(c) => c.product_id,
            ProductCommand::Update(c) => c.product_id,
            ProductCommand::Delete(c) => c.product_id,
        }
    }
}

/// The one event emitted per accepted product mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductEvent {
    pub kind: EventKind,
    pub product_id: ProductId,
    pub version: u64,
    pub snapshot: ProductSnapshot,
    pub occurred_at: DateTime<Utc>,
}

impl Event for ProductEvent {
    type Payload = ProductSnapshot;

    fn kind(&self) -> EventKind {
        self.kind
    }

    fn entity_id(&self) -> EntityId {
        self.product_id.0
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    fn payload(&self) -> ProductSnapshot {
        self.snapshot.clone()
    }
}

/// Wire envelope carrying a product snapshot.
pub type ProductEnvelope = EventEnvelope<ProductSnapshot>;

/// Write record: authoritative product state.
///
/// A deleted product is kept as a tombstone (`is_deleted() == true`) so that its
/// version history continues and its id is never handed out again.
#[derive(Debug, Clone, PartialEq)]
pub struct Product {
    id: ProductId,
    name: String,
    description: Option<String>,
    price: f64,
    stock: i64,
    version: u64,
    created: bool,
    deleted: bool,
}

impl Product {
    /// A not-yet-created instance; the starting point for `CreateProduct`.
    pub fn empty(id: ProductId) -> Self {
        Self {
            id,
            name: String::new(),
            description: None,
            price: 0.0,
            stock: 0,
            version: 0,
            created: false,
            deleted: false,
        }
    }

    /// Rebuild a stored record (used by entity store implementations).
    pub fn restore(snapshot: ProductSnapshot, version: u64, deleted: bool) -> Self {
        Self {
            id: snapshot.id,
            name: snapshot.name,
            description: snapshot.description,
            price: snapshot.price,
            stock: snapshot.stock,
            version,
            created: true,
            deleted,
        }
    }

    pub fn id_typed(&self) -> ProductId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn price(&self) -> f64 {
        self.price
    }

    pub fn stock(&self) -> i64 {
        self.stock
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Created and not deleted.
    pub fn is_live(&self) -> bool {
        self.created && !self.deleted
    }

    pub fn snapshot(&self) -> ProductSnapshot {
        ProductSnapshot {
            id: self.id,
            name: self.name.clone(),
            description: self.description.clone(),
            price: self.price,
            stock: self.stock,
        }
    }
}

impl Entity for Product {
    type Id = ProductId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

impl Aggregate for Product {
    type Command = ProductCommand;
    type Event = ProductEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        let s = &event.snapshot;
        self.id = event.product_id;
        self.name = s.name.clone();
        self.description = s.description.clone();
        self.price = s.price;
        self.stock = s.stock;
        self.version = event.version;
        self.created = true;
        self.deleted = event.kind.is_terminal();
    }

    fn handle(&self, command: &Self::Command) -> Result<Self::Event, Self::Error> {
        self.ensure_product_id(command.product_id())?;
        match command {
            ProductCommand::Create(cmd) => self.handle_create(cmd),
            ProductCommand::Update(cmd) => self.handle_update(cmd),
            ProductCommand::Delete(cmd) => self.handle_delete(cmd),
        }
    }
}

impl Product {
    fn ensure_product_id(&self, product_id: ProductId) -> Result<(), DomainError> {
        if self.id != product_id {
            return Err(DomainError::invariant("product_id mismatch"));
        }
        Ok(())
    }

    fn snapshot_with(&self, fields: &ProductFields) -> ProductSnapshot {
        ProductSnapshot {
            id: self.id,
            name: fields.name.clone(),
            description: fields.description.clone(),
            price: fields.price,
            stock: fields.stock,
        }
    }

    fn handle_create(&self, cmd: &CreateProduct) -> Result<ProductEvent, DomainError> {
        // A tombstone still owns its id.
        if self.created {
            return Err(DomainError::conflict(format!("product {} already exists", self.id)));
        }
        cmd.fields.validate()?;

        Ok(ProductEvent {
            kind: EventKind::Created,
            product_id: self.id,
            version: 0,
            snapshot: self.snapshot_with(&cmd.fields),
            occurred_at: cmd.occurred_at,
        })
    }

    fn handle_update(&self, cmd: &UpdateProduct) -> Result<ProductEvent, DomainError> {
        if !self.is_live() {
            return Err(DomainError::not_found());
        }
        cmd.fields.validate()?;

        Ok(ProductEvent {
            kind: EventKind::Updated,
            product_id: self.id,
            version: self.version + 1,
            snapshot: self.snapshot_with(&cmd.fields),
            occurred_at: cmd.occurred_at,
        })
    }

    fn handle_delete(&self, cmd: &DeleteProduct) -> Result<ProductEvent, DomainError> {
        if !self.is_live() {
            return Err(DomainError::not_found());
        }

        Ok(ProductEvent {
            kind: EventKind::Deleted,
            product_id: self.id,
            version: self.version + 1,
            snapshot: self.snapshot(),
            occurred_at: cmd.occurred_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(name: &str, price: f64, stock: i64) -> ProductFields {
        ProductFields {
            name: name.to_string(),
            description: Some("A fine widget".to_string()),
            price,
            stock,
        }
    }

    fn create(id: ProductId, f: ProductFields) -> ProductCommand {
        ProductCommand::Create(CreateProduct {
            product_id: id,
            fields: f,
            occurred_at: Utc::now(),
        })
    }

    fn update(id: ProductId, f: ProductFields) -> ProductCommand {
        ProductCommand::Update(UpdateProduct {
            product_id: id,
            fields: f,
            occurred_at: Utc::now(),
        })
    }

    fn delete(id: ProductId) -> ProductCommand {
        ProductCommand::Delete(DeleteProduct {
            product_id: id,
            occurred_at: Utc::now(),
        })
    }

    fn created(id: ProductId) -> Product {
        let mut product = Product::empty(id);
        let ev = product.handle(&create(id, fields("Widget", 9.99, 10))).unwrap();
        product.apply(&ev);
        product
    }

    #[test]
    fn create_emits_created_event_at_version_zero() {
        let id = ProductId::generate();
        let product = Product::empty(id);

        let ev = product.handle(&create(id, fields("Widget", 9.99, 10))).unwrap();

        assert_eq!(ev.kind, EventKind::Created);
        assert_eq!(ev.version, 0);
        assert_eq!(ev.snapshot.id, id);
        assert_eq!(ev.snapshot.name, "Widget");
        assert_eq!(ev.snapshot.price, 9.99);
        assert_eq!(ev.snapshot.stock, 10);
    }

    #[test]
    fn create_rejects_invalid_fields() {
        let id = ProductId::generate();
        let product = Product::empty(id);

        for bad in [
            fields("   ", 1.0, 1),
            fields("Widget", -0.01, 1),
            fields("Widget", f64::NAN, 1),
            fields("Widget", 1.0, -1),
        ] {
            let err = product.handle(&create(id, bad)).unwrap_err();
            assert!(matches!(err, DomainError::Validation(_)), "got {err:?}");
        }
    }

    #[test]
    fn create_accepts_zero_price_and_stock() {
        let id = ProductId::generate();
        assert!(Product::empty(id).handle(&create(id, fields("Freebie", 0.0, 0))).is_ok());
    }

    #[test]
    fn create_conflicts_with_existing_product() {
        let id = ProductId::generate();
        let product = created(id);

        let err = product.handle(&create(id, fields("Again", 1.0, 1))).unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }

    #[test]
    fn create_conflicts_with_deleted_product() {
        let id = ProductId::generate();
        let mut product = created(id);
        let ev = product.handle(&delete(id)).unwrap();
        product.apply(&ev);

        let err = product.handle(&create(id, fields("Reborn", 1.0, 1))).unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }

    #[test]
    fn update_requires_existing_product() {
        let id = ProductId::generate();
        let err = Product::empty(id).handle(&update(id, fields("Widget", 1.0, 1))).unwrap_err();
        assert_eq!(err, DomainError::NotFound);
    }

    #[test]
    fn update_increments_version_and_carries_full_snapshot() {
        let id = ProductId::generate();
        let mut product = created(id);

        let ev = product.handle(&update(id, fields("Widget v2", 12.5, 3))).unwrap();
        assert_eq!(ev.kind, EventKind::Updated);
        assert_eq!(ev.version, 1);
        assert_eq!(ev.snapshot.name, "Widget v2");
        assert_eq!(ev.snapshot.description.as_deref(), Some("A fine widget"));

        product.apply(&ev);
        assert_eq!(product.version(), 1);
        assert_eq!(product.snapshot(), ev.snapshot);
    }

    #[test]
    fn update_validates_fields() {
        let id = ProductId::generate();
        let err = created(id).handle(&update(id, fields("", 1.0, 1))).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn delete_is_terminal() {
        let id = ProductId::generate();
        let mut product = created(id);

        let ev = product.handle(&delete(id)).unwrap();
        assert_eq!(ev.kind, EventKind::Deleted);
        assert_eq!(ev.version, 1);
        assert_eq!(ev.snapshot.name, "Widget");

        product.apply(&ev);
        assert!(product.is_deleted());
        assert!(!product.is_live());

        assert_eq!(product.handle(&delete(id)).unwrap_err(), DomainError::NotFound);
        assert_eq!(
            product.handle(&update(id, fields("Zombie", 1.0, 1))).unwrap_err(),
            DomainError::NotFound
        );
    }

    #[test]
    fn command_for_other_product_is_rejected() {
        let product = created(ProductId::generate());
        let err = product.handle(&delete(ProductId::generate())).unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
    }

    #[test]
    fn restore_round_trips_snapshot() {
        let id = ProductId::generate();
        let product = created(id);
        let restored = Product::restore(product.snapshot(), product.version(), false);
        assert_eq!(restored, product);
    }

    #[test]
    fn event_serializes_with_snapshot_payload() {
        let id = ProductId::generate();
        let ev = Product::empty(id).handle(&create(id, fields("Widget", 9.99, 10))).unwrap();
        let env = ProductEnvelope::wrap(catalog_core::EventId::new(), &ev);

        let wire = serde_json::to_value(&env).unwrap();
        assert_eq!(wire["entity_id"], serde_json::json!(id.to_string()));
        assert_eq!(wire["payload"]["id"], serde_json::json!(id.to_string()));
        assert_eq!(wire["payload"]["stock"], serde_json::json!(10));
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        fn valid_fields() -> impl Strategy<Value = ProductFields> {
            ("[A-Za-z][A-Za-z0-9 ]{0,30}", 0.0f64..10_000.0, 0i64..100_000).prop_map(
                |(name, price, stock)| ProductFields {
                    name,
                    description: None,
                    price,
                    stock,
                },
            )
        }

        proptest! {
            /// Versions strictly increase by one per accepted mutation.
            #[test]
            fn versions_increase_by_one(updates in proptest::collection::vec(valid_fields(), 0..20)) {
                let id = ProductId::generate();
                let mut product = created(id);
                let mut last = product.version();

                for f in updates {
                    let ev = product.handle(&update(id, f)).unwrap();
                    prop_assert_eq!(ev.version, last + 1);
                    product.apply(&ev);
                    prop_assert_eq!(product.version(), ev.version);
                    last = ev.version;
                }
            }

            /// Handle is pure: deciding never mutates state.
            #[test]
            fn handle_does_not_mutate(f in valid_fields()) {
                let id = ProductId::generate();
                let product = created(id);
                let before = product.clone();

                let first = product.handle(&update(id, f.clone()));
                let second = product.handle(&update(id, f));

                prop_assert_eq!(&before, &product);
                prop_assert_eq!(first.map(|e| e.version), second.map(|e| e.version));
            }

            #[test]
            fn negative_stock_always_rejected(stock in i64::MIN..0) {
                let id = ProductId::generate();
                let err = Product::empty(id).handle(&create(id, fields("Widget", 1.0, stock))).unwrap_err();
                prop_assert!(matches!(err, DomainError::Validation(_)));
            }
        }
    }
}
