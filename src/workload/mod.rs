// Workload patterns over the coordinator's fixed schema.
//
// Business services are pure consumers of the transaction layer: every unit
// of work is a body `Fn(&Tx) -> TransactionResult<_>` handed to
// `TransactionCoordinator::run`. The bodies here follow that contract: no
// external side effects and idempotent under retry (all row ids are supplied
// by the caller, never generated inside the body).

use crate::catalog::{FINANCIAL, INVENTORY};
use crate::common::{Row, Value};
use crate::transaction::{TransactionError, TransactionResult, Tx};

/// Inserts a user row.
pub fn seed_user(tx: &Tx<'_>, id: i64, username: &str, email: &str) -> TransactionResult<()> {
    tx.insert(
        FINANCIAL,
        "users",
        Row::new()
            .with("id", id)
            .with("username", username)
            .with("email", email),
    )
}

/// Inserts an account row.
pub fn seed_account(
    tx: &Tx<'_>,
    id: i64,
    user_id: i64,
    kind: &str,
    balance: f64,
) -> TransactionResult<()> {
    tx.insert(
        FINANCIAL,
        "accounts",
        Row::new()
            .with("id", id)
            .with("user_id", user_id)
            .with("type", kind)
            .with("balance", balance),
    )
}

/// Inserts a category row; `parent` of `None` marks a root category.
pub fn seed_category(
    tx: &Tx<'_>,
    id: i64,
    name: &str,
    parent: Option<i64>,
) -> TransactionResult<()> {
    tx.insert(
        INVENTORY,
        "categories",
        Row::new()
            .with("id", id)
            .with("name", name)
            .with("parent_id", parent.map(Value::Integer).unwrap_or(Value::Null)),
    )
}

/// Inserts a product row.
pub fn seed_product(
    tx: &Tx<'_>,
    id: i64,
    category_id: i64,
    name: &str,
    price: f64,
    stock: i64,
) -> TransactionResult<()> {
    tx.insert(
        INVENTORY,
        "products",
        Row::new()
            .with("id", id)
            .with("category_id", category_id)
            .with("name", name)
            .with("price", price)
            .with("stock", stock),
    )
}

fn required_row(row: Option<Row>, what: &str) -> TransactionResult<Row> {
    row.ok_or_else(|| TransactionError::constraint(format!("unknown {}", what)))
}

fn decimal_column(row: &Row, column: &str) -> f64 {
    row.get(column).and_then(|v| v.as_decimal()).unwrap_or(0.0)
}

fn integer_column(row: &Row, column: &str) -> i64 {
    row.get(column).and_then(|v| v.as_integer()).unwrap_or(0)
}

/// Body moving `amount` between two accounts and recording a ledger row.
///
/// `ledger_id` is caller-supplied so a restarted body re-inserts the same
/// row instead of inventing a new one.
pub fn transfer(
    from: i64,
    to: i64,
    amount: f64,
    ledger_id: i64,
) -> impl Fn(&Tx<'_>) -> TransactionResult<()> {
    move |tx| {
        let mut src = required_row(
            tx.read(FINANCIAL, "accounts", from)?,
            &format!("account {}", from),
        )?;
        let mut dst = required_row(
            tx.read(FINANCIAL, "accounts", to)?,
            &format!("account {}", to),
        )?;

        let src_balance = decimal_column(&src, "balance");
        if src_balance < amount {
            return Err(TransactionError::constraint(format!(
                "insufficient funds in account {}",
                from
            )));
        }
        let dst_balance = decimal_column(&dst, "balance");

        src.set("balance", src_balance - amount);
        dst.set("balance", dst_balance + amount);
        tx.update(FINANCIAL, "accounts", src)?;
        tx.update(FINANCIAL, "accounts", dst)?;

        tx.insert(
            FINANCIAL,
            "transactions",
            Row::new()
                .with("id", ledger_id)
                .with("account_id", from)
                .with("kind", "transfer")
                .with("amount", amount)
                .with("ts", Value::timestamp_now()),
        )?;
        Ok(())
    }
}

/// All ids of one order placement, supplied by the caller for idempotence.
#[derive(Debug, Clone, Copy)]
pub struct OrderRequest {
    pub order_id: i64,
    pub item_id: i64,
    pub ledger_id: i64,
    pub user_id: i64,
    pub product_id: i64,
    pub qty: i64,
    pub account_id: i64,
}

/// Body placing an order: decrements stock and records the order in the
/// inventory store, then pays for it in the financial store. Commits through
/// both stores or not at all.
pub fn place_order(request: OrderRequest) -> impl Fn(&Tx<'_>) -> TransactionResult<()> {
    move |tx| {
        let mut product = required_row(
            tx.read(INVENTORY, "products", request.product_id)?,
            &format!("product {}", request.product_id),
        )?;
        let stock = integer_column(&product, "stock");
        if stock < request.qty {
            return Err(TransactionError::constraint(format!(
                "insufficient stock for product {}",
                request.product_id
            )));
        }
        let unit_price = decimal_column(&product, "price");
        let total = unit_price * request.qty as f64;

        let mut account = required_row(
            tx.read(FINANCIAL, "accounts", request.account_id)?,
            &format!("account {}", request.account_id),
        )?;
        let balance = decimal_column(&account, "balance");
        if balance < total {
            return Err(TransactionError::constraint(format!(
                "insufficient funds in account {}",
                request.account_id
            )));
        }

        product.set("stock", stock - request.qty);
        tx.update(INVENTORY, "products", product)?;

        tx.insert(
            INVENTORY,
            "orders",
            Row::new()
                .with("id", request.order_id)
                .with("user_id", request.user_id)
                .with("status", "placed")
                .with("total", total)
                .with("ts", Value::timestamp_now()),
        )?;
        tx.insert(
            INVENTORY,
            "order_items",
            Row::new()
                .with("id", request.item_id)
                .with("order_id", request.order_id)
                .with("product_id", request.product_id)
                .with("qty", request.qty)
                .with("unit_price", unit_price),
        )?;

        account.set("balance", balance - total);
        tx.update(FINANCIAL, "accounts", account)?;
        tx.insert(
            FINANCIAL,
            "transactions",
            Row::new()
                .with("id", request.ledger_id)
                .with("account_id", request.account_id)
                .with("kind", "purchase")
                .with("amount", total)
                .with("ts", Value::timestamp_now()),
        )?;
        Ok(())
    }
}
