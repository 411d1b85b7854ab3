use crate::error::{Result, StoreError};
use crate::models::customer::Customer;
use crate::models::item::Item;
use crate::models::review::Review;
use crate::serialize::{self, EntityKind};
use rusqlite::{ffi, Connection};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

#[cfg(test)]
mod tests {
    use super::*;

    // Helper function to create test database
    async fn create_test_db() -> Database {
        let db = Database::new(":memory:").unwrap();
        db.create_schema().await.unwrap();
        db
    }

    // Test database schema creation
    #[tokio::test]
    async fn test_schema_creation() {
        let db = create_test_db().await;

        // Verify tables exist
        let conn = db.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table'")
            .unwrap();
        let tables: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<_, _>>()
            .unwrap();

        assert!(tables.contains(&"customers".to_string()));
        assert!(tables.contains(&"items".to_string()));
        assert!(tables.contains(&"reviews".to_string()));

        // Foreign key enforcement must be on for the review constraints
        let fk_on: i64 = conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(fk_on, 1);
    }

    #[tokio::test]
    async fn test_schema_creation_is_idempotent() {
        let db = create_test_db().await;
        db.create_schema().await.unwrap();
    }

    // Customer lifecycle tests
    #[tokio::test]
    async fn test_full_customer_lifecycle() {
        let db = create_test_db().await;

        // Test insertion
        let customer = db.insert_customer("alice").await.unwrap();
        assert!(customer.id > 0);
        assert_eq!(customer.name, "alice");

        // Test retrieval
        let fetched = db.get_customer(customer.id).await.unwrap();
        assert_eq!(fetched, Some(customer.clone()));
        let by_name = db.find_customer_by_name("alice").await.unwrap();
        assert_eq!(by_name, Some(customer.clone()));

        // Test update
        db.update_customer(customer.id, "alice b").await.unwrap();
        let renamed = db.get_customer(customer.id).await.unwrap().unwrap();
        assert_eq!(renamed.name, "alice b");

        // Test deletion
        db.delete_customer(customer.id).await.unwrap();
        assert_eq!(db.get_customer(customer.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_full_item_lifecycle() {
        let db = create_test_db().await;

        let item = db.insert_item("lamp", 19.5).await.unwrap();
        assert!(item.id > 0);
        assert_eq!(item.price, 19.5);

        let fetched = db.get_item(item.id).await.unwrap();
        assert_eq!(fetched, Some(item.clone()));
        let by_name = db.find_item_by_name("lamp").await.unwrap();
        assert_eq!(by_name, Some(item.clone()));

        db.update_item(item.id, "desk lamp", 24.0).await.unwrap();
        let updated = db.get_item(item.id).await.unwrap().unwrap();
        assert_eq!(updated.name, "desk lamp");
        assert_eq!(updated.price, 24.0);

        db.delete_item(item.id).await.unwrap();
        assert_eq!(db.get_item(item.id).await.unwrap(), None);
    }

    // Uniqueness constraint tests
    #[tokio::test]
    async fn test_duplicate_customer_name_rejected() {
        let db = create_test_db().await;
        db.insert_customer("alice").await.unwrap();

        let err = db.insert_customer("alice").await.unwrap_err();
        match err {
            StoreError::CustomerExists(name) => assert_eq!(name, "alice"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_duplicate_item_name_rejected() {
        let db = create_test_db().await;
        db.insert_item("lamp", 10.0).await.unwrap();

        let err = db.insert_item("lamp", 12.0).await.unwrap_err();
        match err {
            StoreError::ItemExists(name) => assert_eq!(name, "lamp"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rename_to_taken_name_rejected() {
        let db = create_test_db().await;
        db.insert_customer("alice").await.unwrap();
        let bob = db.insert_customer("bob").await.unwrap();

        let err = db.update_customer(bob.id, "alice").await.unwrap_err();
        assert!(matches!(err, StoreError::CustomerExists(_)));
    }

    // Referential integrity tests
    #[tokio::test]
    async fn test_review_requires_existing_parents() {
        let db = create_test_db().await;
        let customer = db.insert_customer("alice").await.unwrap();
        let item = db.insert_item("lamp", 10.0).await.unwrap();

        let err = db
            .insert_review(Some("nice"), customer.id, 999)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::BrokenReference));

        let err = db
            .insert_review(Some("nice"), 999, item.id)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::BrokenReference));

        // Both parents present succeeds
        db.insert_review(Some("nice"), customer.id, item.id)
            .await
            .unwrap();
    }

    // Review lifecycle tests
    #[tokio::test]
    async fn test_full_review_lifecycle() {
        let db = create_test_db().await;
        let customer = db.insert_customer("alice").await.unwrap();
        let item = db.insert_item("lamp", 10.0).await.unwrap();

        let review = db
            .insert_review(Some("bright"), customer.id, item.id)
            .await
            .unwrap();
        assert_eq!(review.comment.as_deref(), Some("bright"));

        let by_customer = db.get_reviews_by_customer(customer.id).await.unwrap();
        assert_eq!(by_customer, vec![review.clone()]);
        let by_item = db.get_reviews_by_item(item.id).await.unwrap();
        assert_eq!(by_item, vec![review.clone()]);

        // Comment is optional and can be cleared
        db.update_review(review.id, None).await.unwrap();
        let updated = db.get_review(review.id).await.unwrap().unwrap();
        assert_eq!(updated.comment, None);

        db.delete_review(review.id).await.unwrap();
        assert_eq!(db.get_review(review.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_missing_rows_surface_not_found() {
        let db = create_test_db().await;

        let err = db.update_customer(42, "nobody").await.unwrap_err();
        assert!(matches!(err, StoreError::CustomerNotFound(42)));
        let err = db.delete_item(42).await.unwrap_err();
        assert!(matches!(err, StoreError::ItemNotFound(42)));
        let err = db.update_review(42, Some("x")).await.unwrap_err();
        assert!(matches!(err, StoreError::ReviewNotFound(42)));
        let err = db.serialize_customer(42).await.unwrap_err();
        assert!(matches!(err, StoreError::CustomerNotFound(42)));
    }

    // Cascade tests
    #[tokio::test]
    async fn test_deleting_customer_cascades_reviews() {
        let db = create_test_db().await;
        let customer = db.insert_customer("alice").await.unwrap();
        let item = db.insert_item("lamp", 10.0).await.unwrap();
        db.insert_review(Some("fine"), customer.id, item.id)
            .await
            .unwrap();

        db.delete_customer(customer.id).await.unwrap();
        assert!(db.get_reviews().await.unwrap().is_empty());
        // The item itself is untouched
        assert!(db.get_item(item.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_deleting_item_cascades_reviews() {
        let db = create_test_db().await;
        let customer = db.insert_customer("alice").await.unwrap();
        let item = db.insert_item("lamp", 10.0).await.unwrap();
        db.insert_review(None, customer.id, item.id).await.unwrap();

        db.delete_item(item.id).await.unwrap();
        assert!(db.get_reviews().await.unwrap().is_empty());
        assert!(db.get_customer(customer.id).await.unwrap().is_some());
    }

    // Derived association tests
    #[tokio::test]
    async fn test_customer_items_follow_attach_order() {
        let db = create_test_db().await;
        let customer = db.insert_customer("alice").await.unwrap();
        let lamp = db.insert_item("lamp", 10.0).await.unwrap();
        let desk = db.insert_item("desk", 80.0).await.unwrap();

        db.insert_review(Some("ok"), customer.id, lamp.id)
            .await
            .unwrap();
        db.insert_review(Some("sturdy"), customer.id, desk.id)
            .await
            .unwrap();

        let items = db.get_customer_items(customer.id).await.unwrap();
        assert_eq!(items, vec![lamp.clone(), desk.clone()]);

        // A second review of the same item projects it again
        db.insert_review(Some("still ok"), customer.id, lamp.id)
            .await
            .unwrap();
        let items = db.get_customer_items(customer.id).await.unwrap();
        assert_eq!(items, vec![lamp.clone(), desk, lamp]);
    }

    #[tokio::test]
    async fn test_customer_items_stay_live() {
        let db = create_test_db().await;
        let customer = db.insert_customer("alice").await.unwrap();
        let lamp = db.insert_item("lamp", 10.0).await.unwrap();
        let review = db
            .insert_review(None, customer.id, lamp.id)
            .await
            .unwrap();

        assert_eq!(db.get_customer_items(customer.id).await.unwrap().len(), 1);

        // No caching: the projection follows the live review set
        db.delete_review(review.id).await.unwrap();
        assert!(db.get_customer_items(customer.id).await.unwrap().is_empty());
    }
}

// Define a struct to represent a database connection
#[derive(Debug)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    // Create a new database connection
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        // SQLite leaves foreign key enforcement off per connection; the
        // review constraints depend on it
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        info!("Database connection established at: {}", db_path);
        Ok(Database {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // Create the database schema
    pub async fn create_schema(&self) -> Result<()> {
        // Malformed serialization rules are a configuration error; reject
        // them here rather than during a later serialization
        serialize::validate_defs()?;

        let conn = self.conn.lock().await;

        // 1. Customers table
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS customers (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL UNIQUE
            );",
        )
        .map_err(|e| {
            error!("Failed creating customers table: {}", e);
            e
        })?;

        // 2. Items table
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS items (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                price REAL NOT NULL
            );",
        )
        .map_err(|e| {
            error!("Failed creating items table: {}", e);
            e
        })?;

        // 3. Reviews table; both parents are mandatory and removing a
        // parent removes its reviews
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS reviews (
                id INTEGER PRIMARY KEY,
                comment TEXT,
                customer_id INTEGER NOT NULL,
                item_id INTEGER NOT NULL,
                CONSTRAINT fk_reviews_customer_id_customers
                    FOREIGN KEY (customer_id) REFERENCES customers (id) ON DELETE CASCADE,
                CONSTRAINT fk_reviews_item_id_items
                    FOREIGN KEY (item_id) REFERENCES items (id) ON DELETE CASCADE
            );",
        )
        .map_err(|e| {
            error!("Failed creating reviews table: {}", e);
            e
        })?;

        info!("Schema created");
        Ok(())
    }

    // Insert a new customer
    pub async fn insert_customer(&self, name: &str) -> Result<Customer> {
        let conn = self.conn.lock().await;
        conn.execute("INSERT INTO customers (name) VALUES (?)", [name])
            .map_err(|e| unique_taken(e, StoreError::CustomerExists(name.to_string())))?;
        let customer = Customer {
            id: conn.last_insert_rowid(),
            name: name.to_string(),
        };
        debug!("Inserted {}", customer);
        Ok(customer)
    }

    // Retrieve a customer by id
    pub async fn get_customer(&self, id: i64) -> Result<Option<Customer>> {
        let conn = self.conn.lock().await;
        match conn.query_row(
            "SELECT id, name FROM customers WHERE id = ?",
            [id],
            |row| {
                Ok(Customer {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            },
        ) {
            Ok(customer) => Ok(Some(customer)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    // Retrieve a customer by its unique name
    pub async fn find_customer_by_name(&self, name: &str) -> Result<Option<Customer>> {
        let conn = self.conn.lock().await;
        match conn.query_row(
            "SELECT id, name FROM customers WHERE name = ?",
            [name],
            |row| {
                Ok(Customer {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            },
        ) {
            Ok(customer) => Ok(Some(customer)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    // Retrieve all customers
    pub async fn get_customers(&self) -> Result<Vec<Customer>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT id, name FROM customers ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(Customer {
                id: row.get(0)?,
                name: row.get(1)?,
            })
        })?;
        let mut customers = Vec::new();
        for customer in rows {
            customers.push(customer?);
        }
        debug!("Fetched {} customers from the database", customers.len());
        Ok(customers)
    }

    // Rename a customer
    pub async fn update_customer(&self, id: i64, name: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE customers SET name = ? WHERE id = ?",
                rusqlite::params![name, id],
            )
            .map_err(|e| unique_taken(e, StoreError::CustomerExists(name.to_string())))?;
        if changed == 0 {
            return Err(StoreError::CustomerNotFound(id));
        }
        debug!("Customer {} renamed to {}", id, name);
        Ok(())
    }

    // Delete a customer; their reviews go with them
    pub async fn delete_customer(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute("DELETE FROM customers WHERE id = ?", [id])?;
        if changed == 0 {
            return Err(StoreError::CustomerNotFound(id));
        }
        debug!("Customer deleted: {}", id);
        Ok(())
    }

    // Insert a new item
    pub async fn insert_item(&self, name: &str, price: f64) -> Result<Item> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO items (name, price) VALUES (?, ?)",
            rusqlite::params![name, price],
        )
        .map_err(|e| unique_taken(e, StoreError::ItemExists(name.to_string())))?;
        let item = Item {
            id: conn.last_insert_rowid(),
            name: name.to_string(),
            price,
        };
        debug!("Inserted {}", item);
        Ok(item)
    }

    // Retrieve an item by id
    pub async fn get_item(&self, id: i64) -> Result<Option<Item>> {
        let conn = self.conn.lock().await;
        match conn.query_row(
            "SELECT id, name, price FROM items WHERE id = ?",
            [id],
            |row| {
                Ok(Item {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    price: row.get(2)?,
                })
            },
        ) {
            Ok(item) => Ok(Some(item)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    // Retrieve an item by its unique name
    pub async fn find_item_by_name(&self, name: &str) -> Result<Option<Item>> {
        let conn = self.conn.lock().await;
        match conn.query_row(
            "SELECT id, name, price FROM items WHERE name = ?",
            [name],
            |row| {
                Ok(Item {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    price: row.get(2)?,
                })
            },
        ) {
            Ok(item) => Ok(Some(item)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    // Retrieve all items
    pub async fn get_items(&self) -> Result<Vec<Item>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT id, name, price FROM items ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(Item {
                id: row.get(0)?,
                name: row.get(1)?,
                price: row.get(2)?,
            })
        })?;
        let mut items = Vec::new();
        for item in rows {
            items.push(item?);
        }
        debug!("Fetched {} items from the database", items.len());
        Ok(items)
    }

    // Update an item's name and price
    pub async fn update_item(&self, id: i64, name: &str, price: f64) -> Result<()> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE items SET name = ?, price = ? WHERE id = ?",
                rusqlite::params![name, price, id],
            )
            .map_err(|e| unique_taken(e, StoreError::ItemExists(name.to_string())))?;
        if changed == 0 {
            return Err(StoreError::ItemNotFound(id));
        }
        debug!("Item {} updated", id);
        Ok(())
    }

    // Delete an item; its reviews go with it
    pub async fn delete_item(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute("DELETE FROM items WHERE id = ?", [id])?;
        if changed == 0 {
            return Err(StoreError::ItemNotFound(id));
        }
        debug!("Item deleted: {}", id);
        Ok(())
    }

    // Insert a new review linking a customer and an item
    pub async fn insert_review(
        &self,
        comment: Option<&str>,
        customer_id: i64,
        item_id: i64,
    ) -> Result<Review> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO reviews (comment, customer_id, item_id) VALUES (?, ?, ?)",
            rusqlite::params![comment, customer_id, item_id],
        )
        .map_err(fk_broken)?;
        let review = Review {
            id: conn.last_insert_rowid(),
            comment: comment.map(String::from),
            customer_id,
            item_id,
        };
        debug!("Inserted {}", review);
        Ok(review)
    }

    // Retrieve a review by id
    pub async fn get_review(&self, id: i64) -> Result<Option<Review>> {
        let conn = self.conn.lock().await;
        match conn.query_row(
            "SELECT id, comment, customer_id, item_id FROM reviews WHERE id = ?",
            [id],
            |row| {
                Ok(Review {
                    id: row.get(0)?,
                    comment: row.get(1)?,
                    customer_id: row.get(2)?,
                    item_id: row.get(3)?,
                })
            },
        ) {
            Ok(review) => Ok(Some(review)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    // Retrieve all reviews
    pub async fn get_reviews(&self) -> Result<Vec<Review>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT id, comment, customer_id, item_id FROM reviews ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(Review {
                id: row.get(0)?,
                comment: row.get(1)?,
                customer_id: row.get(2)?,
                item_id: row.get(3)?,
            })
        })?;
        let mut reviews = Vec::new();
        for review in rows {
            reviews.push(review?);
        }
        Ok(reviews)
    }

    // Reviews written by one customer, in attach order
    pub async fn get_reviews_by_customer(&self, customer_id: i64) -> Result<Vec<Review>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, comment, customer_id, item_id FROM reviews
             WHERE customer_id = ? ORDER BY id",
        )?;
        let rows = stmt.query_map([customer_id], |row| {
            Ok(Review {
                id: row.get(0)?,
                comment: row.get(1)?,
                customer_id: row.get(2)?,
                item_id: row.get(3)?,
            })
        })?;
        let mut reviews = Vec::new();
        for review in rows {
            reviews.push(review?);
        }
        Ok(reviews)
    }

    // Reviews attached to one item, in attach order
    pub async fn get_reviews_by_item(&self, item_id: i64) -> Result<Vec<Review>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, comment, customer_id, item_id FROM reviews
             WHERE item_id = ? ORDER BY id",
        )?;
        let rows = stmt.query_map([item_id], |row| {
            Ok(Review {
                id: row.get(0)?,
                comment: row.get(1)?,
                customer_id: row.get(2)?,
                item_id: row.get(3)?,
            })
        })?;
        let mut reviews = Vec::new();
        for review in rows {
            reviews.push(review?);
        }
        Ok(reviews)
    }

    // Update a review's comment
    pub async fn update_review(&self, id: i64, comment: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE reviews SET comment = ? WHERE id = ?",
            rusqlite::params![comment, id],
        )?;
        if changed == 0 {
            return Err(StoreError::ReviewNotFound(id));
        }
        debug!("Review {} updated", id);
        Ok(())
    }

    // Delete a review
    pub async fn delete_review(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute("DELETE FROM reviews WHERE id = ?", [id])?;
        if changed == 0 {
            return Err(StoreError::ReviewNotFound(id));
        }
        debug!("Review deleted: {}", id);
        Ok(())
    }

    // Items this customer has reviewed: review.item projected across
    // their reviews, one element per review, in attach order. Computed
    // on every call so it always tracks the live review set.
    pub async fn get_customer_items(&self, customer_id: i64) -> Result<Vec<Item>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT items.id, items.name, items.price
             FROM reviews
             JOIN items ON items.id = reviews.item_id
             WHERE reviews.customer_id = ?
             ORDER BY reviews.id",
        )?;
        let rows = stmt.query_map([customer_id], |row| {
            Ok(Item {
                id: row.get(0)?,
                name: row.get(1)?,
                price: row.get(2)?,
            })
        })?;
        let mut items = Vec::new();
        for item in rows {
            items.push(item?);
        }
        Ok(items)
    }

    // Serialize an entity with its type's exclusion rules applied
    pub async fn serialize(&self, kind: EntityKind, id: i64) -> Result<Value> {
        let conn = self.conn.lock().await;
        debug!("Serializing {:?} {}", kind, id);
        serialize::serialize_entity(&conn, kind, id)
    }

    pub async fn serialize_customer(&self, id: i64) -> Result<Value> {
        self.serialize(EntityKind::Customer, id).await
    }

    pub async fn serialize_item(&self, id: i64) -> Result<Value> {
        self.serialize(EntityKind::Item, id).await
    }

    pub async fn serialize_review(&self, id: i64) -> Result<Value> {
        self.serialize(EntityKind::Review, id).await
    }
}

// Map a UNIQUE constraint failure to the caller-facing exists error;
// anything else passes through untouched
fn unique_taken(err: rusqlite::Error, exists: StoreError) -> StoreError {
    match err {
        rusqlite::Error::SqliteFailure(f, _)
            if f.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE =>
        {
            exists
        }
        other => StoreError::Sqlite(other),
    }
}

// Map a FOREIGN KEY constraint failure to the referential-integrity error
fn fk_broken(err: rusqlite::Error) -> StoreError {
    match err {
        rusqlite::Error::SqliteFailure(f, _)
            if f.extended_code == ffi::SQLITE_CONSTRAINT_FOREIGNKEY =>
        {
            StoreError::BrokenReference
        }
        other => StoreError::Sqlite(other),
    }
}
