use crate::{
    entities::{cart, cart_item, Cart, CartItem, CartItemModel, CartModel, Offer, Product},
    errors::ServiceError,
    events::{Event, EventSender},
    pricing::{self, LinePrice},
};
use chrono::Utc;
use sea_orm::{
    sea_query::Condition, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Who a cart (or address, or order) belongs to. Authenticated users win over
/// guest sessions when both are known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum CartOwner {
    User(Uuid),
    Session(String),
}

impl CartOwner {
    /// Rejects a request that identifies neither a user nor a session.
    pub fn from_parts(
        user_id: Option<Uuid>,
        session_id: Option<String>,
    ) -> Result<Self, ServiceError> {
        match (user_id, session_id.filter(|s| !s.trim().is_empty())) {
            (Some(user_id), _) => Ok(CartOwner::User(user_id)),
            (None, Some(session_id)) => Ok(CartOwner::Session(session_id)),
            (None, None) => Err(ServiceError::ValidationError(
                "a user id or session id is required".to_string(),
            )),
        }
    }

    pub fn user_id(&self) -> Option<Uuid> {
        match self {
            CartOwner::User(id) => Some(*id),
            CartOwner::Session(_) => None,
        }
    }

    pub fn session_id(&self) -> Option<String> {
        match self {
            CartOwner::User(_) => None,
            CartOwner::Session(id) => Some(id.clone()),
        }
    }

    /// Filter on the `user_id` / `session_id` columns of an owned table.
    pub fn condition<U, S>(&self, user_col: U, session_col: S) -> Condition
    where
        U: ColumnTrait,
        S: ColumnTrait,
    {
        match self {
            CartOwner::User(id) => Condition::all().add(user_col.eq(*id)),
            CartOwner::Session(id) => Condition::all().add(session_col.eq(id.clone())),
        }
    }
}

/// Cart header together with its lines in insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartWithItems {
    #[serde(flatten)]
    pub cart: CartModel,
    pub items: Vec<CartItemModel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddItemInput {
    pub product_id: Uuid,
    pub size: String,
    pub quantity: i32,
    #[serde(default)]
    pub offer_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveItemInput {
    pub product_id: Uuid,
    pub size: String,
    #[serde(default)]
    pub offer_id: Option<Uuid>,
    /// Units to remove; the whole line when absent
    #[serde(default)]
    pub quantity: Option<i32>,
}

/// `(product_count, total_price)` for a set of lines.
pub fn compute_totals(items: &[CartItemModel]) -> (i32, i64) {
    items.iter().fold((0, 0), |(count, total), item| {
        (count + item.quantity, total + item.line_total)
    })
}

/// Owns cart contents. Every mutation re-prices the touched line and
/// recomputes the cart totals from the stored lines.
#[derive(Clone)]
pub struct CartService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
}

impl CartService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Arc<EventSender>) -> Self {
        Self { db, event_sender }
    }

    /// Returns the owner's cart, creating an empty one on first use.
    #[instrument(skip(self))]
    pub async fn get_or_create_cart(&self, owner: &CartOwner) -> Result<CartModel, ServiceError> {
        find_or_create(&*self.db, owner).await
    }

    /// Returns the owner's cart with its items, if the owner has a cart.
    #[instrument(skip(self))]
    pub async fn get_cart(&self, owner: &CartOwner) -> Result<Option<CartWithItems>, ServiceError> {
        match find_for_owner(&*self.db, owner).await? {
            Some(cart) => {
                let items = load_items(&*self.db, cart.id).await?;
                Ok(Some(CartWithItems { cart, items }))
            }
            None => Ok(None),
        }
    }

    pub async fn items(&self, cart_id: Uuid) -> Result<Vec<CartItemModel>, ServiceError> {
        load_items(&*self.db, cart_id).await
    }

    /// Adds units of a (product, size, offer) line, creating the line on first add.
    ///
    /// # Arguments
    ///
    /// * `owner` - Cart owner; the cart is created if missing
    /// * `input` - Product, size, quantity to add and the requested offer
    ///
    /// # Returns
    ///
    /// * `Ok(CartWithItems)` - Cart with recomputed totals
    /// * `Err(ServiceError::ValidationError)` - Non-positive quantity or empty size
    /// * `Err(ServiceError::NotFound)` - Product unknown or inactive
    #[instrument(skip(self))]
    pub async fn add_item(
        &self,
        owner: &CartOwner,
        input: AddItemInput,
    ) -> Result<CartWithItems, ServiceError> {
        if input.quantity < 1 {
            return Err(ServiceError::ValidationError(
                "quantity must be at least 1".to_string(),
            ));
        }
        let size = input.size.trim().to_string();
        if size.is_empty() {
            return Err(ServiceError::ValidationError("size is required".to_string()));
        }

        let txn = self.db.begin().await?;
        let cart = find_or_create(&txn, owner).await?;

        let product = Product::find_by_id(input.product_id)
            .one(&txn)
            .await?
            .filter(|p| p.active)
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Product {} not found", input.product_id))
            })?;

        let existing = find_line(&txn, cart.id, input.product_id, &size, input.offer_id).await?;
        let quantity = existing.as_ref().map_or(0, |line| line.quantity) + input.quantity;
        let price = price_for(
            &txn,
            product.id,
            product.base_price,
            input.offer_id,
            quantity,
        )
        .await?;
        let now = Utc::now();

        match existing {
            Some(line) => {
                let mut line: cart_item::ActiveModel = line.into();
                apply_price(&mut line, quantity, &price);
                line.updated_at = Set(now);
                line.update(&txn).await?;
            }
            None => {
                let position = next_position(&txn, cart.id).await?;
                let mut line = cart_item::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    cart_id: Set(cart.id),
                    product_id: Set(product.id),
                    product_name: Set(product.name.clone()),
                    size: Set(size),
                    offer_id: Set(input.offer_id),
                    position: Set(position),
                    created_at: Set(now),
                    updated_at: Set(now),
                    ..Default::default()
                };
                apply_price(&mut line, quantity, &price);
                line.insert(&txn).await?;
            }
        }

        let cart = recompute_totals(&txn, cart).await?;
        let items = load_items(&txn, cart.id).await?;
        txn.commit().await?;

        info!(cart_id = %cart.id, product_id = %input.product_id, quantity, "item added to cart");
        Ok(CartWithItems { cart, items })
    }

    /// Removes units from a line; the line is deleted when it reaches zero.
    #[instrument(skip(self))]
    pub async fn remove_item(
        &self,
        owner: &CartOwner,
        input: RemoveItemInput,
    ) -> Result<CartWithItems, ServiceError> {
        if matches!(input.quantity, Some(q) if q < 1) {
            return Err(ServiceError::ValidationError(
                "quantity must be at least 1".to_string(),
            ));
        }

        let txn = self.db.begin().await?;
        let cart = find_for_owner(&txn, owner)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Cart not found".to_string()))?;

        let line = find_line(&txn, cart.id, input.product_id, input.size.trim(), input.offer_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Cart item not found".to_string()))?;

        let remaining = input.quantity.map_or(0, |q| line.quantity - q);
        if remaining <= 0 {
            CartItem::delete_by_id(line.id).exec(&txn).await?;
        } else {
            let base_price = Product::find_by_id(line.product_id)
                .one(&txn)
                .await?
                .map_or(line.base_unit_price, |p| p.base_price);
            let price = price_for(
                &txn,
                line.product_id,
                base_price,
                line.offer_id,
                remaining,
            )
            .await?;
            let mut line: cart_item::ActiveModel = line.into();
            apply_price(&mut line, remaining, &price);
            line.updated_at = Set(Utc::now());
            line.update(&txn).await?;
        }

        let cart = recompute_totals(&txn, cart).await?;
        let items = load_items(&txn, cart.id).await?;
        txn.commit().await?;

        debug!(cart_id = %cart.id, remaining, "item removed from cart");
        Ok(CartWithItems { cart, items })
    }

    /// Deletes every line and zeroes the totals. Clearing an empty or missing
    /// cart is a no-op.
    #[instrument(skip(self))]
    pub async fn clear_cart(&self, cart_id: Uuid) -> Result<(), ServiceError> {
        let txn = self.db.begin().await?;
        let Some(cart) = Cart::find_by_id(cart_id).one(&txn).await? else {
            return Ok(());
        };
        let deleted = CartItem::delete_many()
            .filter(cart_item::Column::CartId.eq(cart_id))
            .exec(&txn)
            .await?
            .rows_affected;
        recompute_totals(&txn, cart).await?;
        txn.commit().await?;

        if deleted > 0 {
            self.event_sender.send_or_log(Event::CartCleared { cart_id });
            info!(%cart_id, deleted, "cart cleared");
        }
        Ok(())
    }
}

fn apply_price(line: &mut cart_item::ActiveModel, quantity: i32, price: &LinePrice) {
    line.quantity = Set(quantity);
    line.base_unit_price = Set(price.base_unit_price);
    line.unit_price = Set(price.unit_price);
    line.line_total = Set(price.line_total);
    line.discount_percent = Set(price.discount_percent);
}

async fn price_for<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
    base_price: i64,
    offer_id: Option<Uuid>,
    quantity: i32,
) -> Result<LinePrice, ServiceError> {
    let offer = match offer_id {
        Some(id) => Offer::find_by_id(id).one(conn).await?,
        None => None,
    };
    let terms = offer.as_ref().map(|o| o.terms());
    let price = pricing::price_line(product_id, base_price, terms.as_ref(), quantity);
    if let Some(reason) = price.rejected {
        debug!(%product_id, ?offer_id, ?reason, "offer not applied");
    } else if offer_id.is_some() && offer.is_none() {
        debug!(%product_id, ?offer_id, "unknown offer ignored");
    }
    Ok(price)
}

async fn find_for_owner<C: ConnectionTrait>(
    conn: &C,
    owner: &CartOwner,
) -> Result<Option<CartModel>, ServiceError> {
    Ok(Cart::find()
        .filter(owner.condition(cart::Column::UserId, cart::Column::SessionId))
        .order_by_desc(cart::Column::CreatedAt)
        .one(conn)
        .await?)
}

async fn find_or_create<C: ConnectionTrait>(
    conn: &C,
    owner: &CartOwner,
) -> Result<CartModel, ServiceError> {
    if let Some(cart) = find_for_owner(conn, owner).await? {
        return Ok(cart);
    }
    let now = Utc::now();
    let cart = cart::ActiveModel {
        id: Set(Uuid::new_v4()),
        user_id: Set(owner.user_id()),
        session_id: Set(owner.session_id()),
        product_count: Set(0),
        total_price: Set(0),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(conn)
    .await?;
    debug!(cart_id = %cart.id, "created cart");
    Ok(cart)
}

async fn find_line<C: ConnectionTrait>(
    conn: &C,
    cart_id: Uuid,
    product_id: Uuid,
    size: &str,
    offer_id: Option<Uuid>,
) -> Result<Option<CartItemModel>, ServiceError> {
    let offer_filter = match offer_id {
        Some(id) => cart_item::Column::OfferId.eq(id),
        None => cart_item::Column::OfferId.is_null(),
    };
    Ok(CartItem::find()
        .filter(cart_item::Column::CartId.eq(cart_id))
        .filter(cart_item::Column::ProductId.eq(product_id))
        .filter(cart_item::Column::Size.eq(size))
        .filter(offer_filter)
        .one(conn)
        .await?)
}

async fn next_position<C: ConnectionTrait>(conn: &C, cart_id: Uuid) -> Result<i32, ServiceError> {
    let last = CartItem::find()
        .filter(cart_item::Column::CartId.eq(cart_id))
        .order_by_desc(cart_item::Column::Position)
        .one(conn)
        .await?;
    Ok(last.map_or(0, |item| item.position + 1))
}

async fn load_items<C: ConnectionTrait>(
    conn: &C,
    cart_id: Uuid,
) -> Result<Vec<CartItemModel>, ServiceError> {
    Ok(CartItem::find()
        .filter(cart_item::Column::CartId.eq(cart_id))
        .order_by_asc(cart_item::Column::Position)
        .all(conn)
        .await?)
}

/// Rewrites `product_count` and `total_price` from the stored lines.
async fn recompute_totals<C: ConnectionTrait>(
    conn: &C,
    cart: CartModel,
) -> Result<CartModel, ServiceError> {
    let items = load_items(conn, cart.id).await?;
    let (product_count, total_price) = compute_totals(&items);
    let mut active: cart::ActiveModel = cart.into();
    active.product_count = Set(product_count);
    active.total_price = Set(total_price);
    active.updated_at = Set(Utc::now());
    Ok(active.update(conn).await?)
}
