use sqlx::SqlitePool;
use tracing::info;

use crate::cache::CacheManager;
use crate::cart::CartService;
use crate::env::{Env, EnvError};
use crate::kv::DynStore;
use crate::menu::MenuService;
use crate::order::OrderService;

/// Every service the API and CLI need, wired once at startup.
#[derive(Debug, Clone)]
pub struct AppContext {
    pub pool: SqlitePool,
    pub store: DynStore,
    pub menu: MenuService,
    pub carts: CartService,
    pub orders: OrderService,
}

impl AppContext {
    pub async fn from_env(env: &Env, pool: SqlitePool) -> Result<Self, EnvError> {
        let store = env.get_store(&pool).await?;
        let gateway = env.get_gateway()?;
        let notifier = env.notifications.build_notifier()?;
        let policy = env.order_policy()?;

        let menu = MenuService::new(
            pool.clone(),
            CacheManager::new("menu", env.menu_cache_config()).with_write_through(store.clone()),
        );
        let carts = CartService::new(store.clone(), menu.clone(), env.cart_config());
        let orders = OrderService::new(pool.clone(), carts.clone(), gateway, notifier, policy)
            .with_webhook_secret(env.gateway.webhook_secret.clone());

        info!(
            timezone = %env.school_timezone,
            cutoff_minutes = env.order_cutoff_minutes,
            "Services initialised"
        );

        Ok(Self {
            pool,
            store,
            menu,
            carts,
            orders,
        })
    }
}
