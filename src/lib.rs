#[macro_use]
extern crate rocket;

pub mod auth;
pub mod db;
pub mod request_logger;
pub mod routes;

use crate::auth::config::StorageBackend;
use crate::auth::{AuthBackends, AuthConfig, AuthState};
use crate::db::ShopDb;
use crate::request_logger::RequestLogger;
use chrono::Utc;
use env_logger::Env;
use rocket::fairing::{self, AdHoc};
use rocket::http::Method;
use rocket::{Build, Rocket};
use rocket_cors::{AllowedOrigins, CorsOptions};
use rocket_db_pools::Database;
use rocket_okapi::{
    openapi_get_routes,
    rapidoc::{GeneralConfig, HideShowConfig, RapiDocConfig, make_rapidoc},
    settings::UrlObject,
    swagger_ui::{SwaggerUIConfig, make_swagger_ui},
};
use std::sync::Once;
use std::time::Duration;

static LOGGER: Once = Once::new();

fn init_logger() {
    LOGGER.call_once(|| {
        env_logger::Builder::from_env(
            Env::default().default_filter_or("info,rocket::server=warn,rocket::request=warn"),
        )
        .init();
    });
}

pub fn rocket() -> Rocket<Build> {
    init_logger();
    log::info!("starting shop API server");

    let rocket = rocket::build()
        .attach(RequestLogger)
        .attach(AdHoc::try_on_ignite("CORS", |rocket| async move {
            let cors = CorsOptions::default()
                .allowed_origins(AllowedOrigins::all())
                .allowed_methods(
                    vec![
                        Method::Get,
                        Method::Post,
                        Method::Put,
                        Method::Delete,
                        Method::Patch,
                    ]
                    .into_iter()
                    .map(From::from)
                    .collect(),
                )
                .allow_credentials(true)
                .to_cors();
            match cors {
                Ok(cors) => Ok(rocket.attach(cors)),
                Err(err) => {
                    log::error!("invalid CORS configuration: {}", err);
                    Err(rocket)
                }
            }
        }));

    let rocket = match StorageBackend::from_env() {
        Ok(StorageBackend::Postgres) => rocket
            .attach(ShopDb::init())
            .attach(AdHoc::try_on_ignite("Postgres Auth Stores", |rocket| async move {
                let pool = match ShopDb::fetch(&rocket) {
                    Some(db) => (**db).clone(),
                    None => {
                        log::error!("database pool not available for auth stores");
                        return Err(rocket);
                    }
                };
                if let Err(err) = db::run_migrations(&pool).await {
                    log::error!("database migrations failed: {}", err);
                    return Err(rocket);
                }
                install_auth_state(rocket, AuthBackends::postgres(pool))
            })),
        Ok(StorageBackend::Memory) => {
            rocket.attach(AdHoc::try_on_ignite("In-Memory Auth Stores", |rocket| async move {
                log::warn!("using in-memory auth stores; sessions will not survive a restart");
                install_auth_state(rocket, AuthBackends::memory())
            }))
        }
        Err(err) => {
            let message = err.to_string();
            rocket.attach(AdHoc::try_on_ignite("Storage Selection", move |rocket| async move {
                log::error!("{}", message);
                Err(rocket)
            }))
        }
    };

    mount_api(rocket.attach(expiry_purge()))
}

fn install_auth_state(rocket: Rocket<Build>, backends: AuthBackends) -> fairing::Result {
    let state = AuthConfig::from_env().and_then(|config| AuthState::new(config, backends));
    match state {
        Ok(state) => {
            log::info!("auth configuration loaded: {:?}", state.config);
            Ok(rocket.manage(state))
        }
        Err(err) => {
            log::error!("refusing to start: {}", err);
            Err(rocket)
        }
    }
}

/// Periodically drops revocation entries and verification records that can
/// no longer matter.
fn expiry_purge() -> AdHoc {
    AdHoc::on_liftoff("Spawn Expiry Purge", |rocket| {
        Box::pin(async move {
            let Some(state) = rocket.state::<AuthState>().cloned() else {
                log::error!("failed to spawn expiry purge: auth state not found");
                return;
            };
            let period = Duration::from_secs(state.config.purge_interval_secs.max(1));
            tokio::spawn(async move {
                log::info!("starting expiry purge every {:?}", period);
                let mut ticker = tokio::time::interval(period);
                loop {
                    ticker.tick().await;
                    match state.purge_expired(Utc::now()).await {
                        Ok((0, 0)) => {}
                        Ok((revoked, codes)) => log::info!(
                            "purged {} revocation entries and {} verification records",
                            revoked,
                            codes
                        ),
                        Err(err) => log::warn!("expiry purge failed: {}", err),
                    }
                }
            });
        })
    })
}

/// Mounts the API, its catchers and the generated documentation.
pub fn mount_api(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket
        .mount(
            "/api/v1",
            openapi_get_routes![
                // Health routes
                routes::health::health_check,
                // Auth routes
                auth::routes::register,
                auth::routes::confirm_email,
                auth::routes::request_otp,
                auth::routes::verify_otp,
                auth::routes::login,
                auth::routes::refresh,
                auth::routes::logout,
                auth::routes::forgot_password,
                auth::routes::reset_password,
                // Account routes
                routes::account::me,
                routes::account::change_phone,
                routes::account::verify_phone,
                // Admin routes
                routes::admin::change_role,
            ],
        )
        .register(
            "/",
            catchers![
                auth::routes::bad_request,
                auth::routes::unauthorized,
                auth::routes::forbidden,
                auth::routes::not_found,
                auth::routes::unprocessable,
                auth::routes::internal_error,
            ],
        )
        .mount(
            "/api/docs/swagger/",
            make_swagger_ui(&SwaggerUIConfig {
                url: "../../v1/openapi.json".to_owned(),
                ..Default::default()
            }),
        )
        .mount(
            "/api/docs/rapidoc/",
            make_rapidoc(&RapiDocConfig {
                general: GeneralConfig {
                    spec_urls: vec![UrlObject::new("Shop API", "../../v1/openapi.json")],
                    ..Default::default()
                },
                hide_show: HideShowConfig {
                    allow_spec_url_load: false,
                    allow_spec_file_load: false,
                    ..Default::default()
                },
                ..Default::default()
            }),
        )
}

#[cfg_attr(not(test), allow(dead_code))]
pub mod test_support {
    use std::collections::HashMap;
    use std::sync::Arc;

    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use rocket::config::LogLevel;
    use rocket::figment::Figment;
    use rocket::local::asynchronous::Client as AsyncClient;
    use rocket::local::blocking::Client;
    use rocket::{Build, Rocket, Route};

    use crate::auth::config::COOKIE_KEY_LEN;
    use crate::auth::identity::{Identity, NewIdentity};
    use crate::auth::notifier::RecordingNotifier;
    use crate::auth::responses::Role;
    use crate::auth::{AuthBackends, AuthConfig, AuthState};
    use crate::request_logger::RequestLogger;

    pub use database::{TestDatabase, TestDatabaseError};

    /// Configuration with fixed secrets and cheap argon2 parameters.
    pub fn test_config() -> AuthConfig {
        let env: HashMap<&str, String> = HashMap::from([
            ("SHOP_ACCESS_TOKEN_SECRET", "test-access-secret".to_string()),
            ("SHOP_REFRESH_TOKEN_SECRET", "test-refresh-secret".to_string()),
            ("SHOP_COOKIES_SECRET", STANDARD.encode([42u8; COOKIE_KEY_LEN])),
            ("SHOP_COOKIE_SECURE", "false".to_string()),
            ("SHOP_ARGON2_MEMORY_KIB", "1024".to_string()),
            ("SHOP_ARGON2_ITERATIONS", "1".to_string()),
            ("SHOP_ARGON2_PARALLELISM", "1".to_string()),
        ]);
        AuthConfig::from_lookup(|key| env.get(key).cloned()).expect("test configuration is valid")
    }

    /// In-memory `AuthState` whose notifications land in `notifier`.
    pub fn memory_state(notifier: Arc<RecordingNotifier>) -> AuthState {
        AuthState::new(test_config(), AuthBackends::memory().with_notifier(notifier))
            .expect("auth state builds")
    }

    /// Insert a verified identity directly, bypassing registration.
    pub async fn seed_identity(state: &AuthState, email: &str, password: &str, role: Role) -> Identity {
        let password_hash = state
            .passwords
            .hash_password(password)
            .expect("password hashes");
        let identity = state
            .identities
            .create(NewIdentity {
                email: email.to_lowercase(),
                phone: None,
                password_hash,
                role,
            })
            .await
            .expect("identity inserted");
        state
            .identities
            .mark_email_verified(identity.id)
            .await
            .expect("email verified");
        identity
    }

    pub mod database {
        use log::LevelFilter;
        use rocket_db_pools::sqlx::postgres::{PgConnectOptions, PgPoolOptions};
        use rocket_db_pools::sqlx::{self, ConnectOptions, PgPool};
        use testcontainers_modules::postgres::Postgres;
        use testcontainers_modules::testcontainers::{
            ContainerAsync, core::error::TestcontainersError, runners::AsyncRunner,
        };
        use thiserror::Error;

        use crate::db::MIGRATOR;

        #[derive(Debug, Error)]
        pub enum TestDatabaseError {
            #[error("database error: {0}")]
            Sqlx(#[from] sqlx::Error),
            #[error("migration error: {0}")]
            Migration(#[from] sqlx::migrate::MigrateError),
            #[error("container error: {0}")]
            Container(#[from] TestcontainersError),
        }

        /// Disposable Postgres instance with the schema applied.
        pub struct TestDatabase {
            pool: Option<PgPool>,
            container: Option<ContainerAsync<Postgres>>,
        }

        impl TestDatabase {
            /// Launch a Postgres container and run migrations against it.
            pub async fn new() -> Result<Self, TestDatabaseError> {
                let container = Postgres::default().start().await?;

                let host = container.get_host().await?.to_string();
                let port = container.get_host_port_ipv4(5432).await?;
                let url = format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

                let options: PgConnectOptions = url.parse().map_err(TestDatabaseError::Sqlx)?;
                let options = options.log_statements(LevelFilter::Off);

                let pool = PgPoolOptions::new()
                    .max_connections(5)
                    .connect_with(options)
                    .await
                    .map_err(TestDatabaseError::Sqlx)?;

                MIGRATOR.run(&pool).await?;

                Ok(Self {
                    pool: Some(pool),
                    container: Some(container),
                })
            }

            pub fn pool(&self) -> &PgPool {
                self.pool.as_ref().expect("test database pool is available")
            }

            pub fn pool_clone(&self) -> PgPool {
                self.pool().clone()
            }

            /// Close pool connections and stop the container.
            pub async fn close(mut self) -> Result<(), TestDatabaseError> {
                if let Some(pool) = self.pool.take() {
                    pool.close().await;
                }
                if let Some(container) = self.container.take() {
                    container.rm().await?;
                }
                Ok(())
            }
        }
    }

    /// Builder for constructing Rocket instances tailored for integration tests.
    pub struct TestRocketBuilder {
        figment: Figment,
        mounts: Vec<(String, Vec<Route>)>,
        auth_state: Option<AuthState>,
        full_api: bool,
    }

    impl Default for TestRocketBuilder {
        fn default() -> Self {
            Self::new()
        }
    }

    impl TestRocketBuilder {
        /// Start a builder with sensible defaults: random port, logging disabled.
        pub fn new() -> Self {
            let figment = rocket::Config::figment()
                .merge(("port", 0))
                .merge(("log_level", LogLevel::Off))
                .merge(("cli_colors", false));

            Self {
                figment,
                mounts: Vec::new(),
                auth_state: None,
                full_api: false,
            }
        }

        /// Mount routes under `/api/v1`.
        pub fn mount_api_routes(mut self, routes: Vec<Route>) -> Self {
            self.mounts.push(("/api/v1".to_string(), routes));
            self
        }

        /// Mount every API route and catcher, as the server does.
        pub fn with_full_api(mut self) -> Self {
            self.full_api = true;
            self
        }

        pub fn manage_auth_state(mut self, state: AuthState) -> Self {
            self.auth_state = Some(state);
            self
        }

        /// Finish building the Rocket instance.
        pub fn build(self) -> Rocket<Build> {
            let mut rocket = rocket::custom(self.figment).attach(RequestLogger);

            for (base, routes) in self.mounts {
                rocket = rocket.mount(base, routes);
            }

            if self.full_api {
                rocket = super::mount_api(rocket);
            }

            if let Some(state) = self.auth_state {
                rocket = rocket.manage(state);
            }

            rocket
        }

        /// Convenience helper to produce a blocking local client.
        pub fn blocking_client(self) -> Client {
            Client::tracked(self.build()).expect("valid Rocket instance")
        }

        /// Convenience helper to produce an asynchronous local client.
        pub async fn async_client(self) -> AsyncClient {
            AsyncClient::tracked(self.build())
                .await
                .expect("valid Rocket instance")
        }

        /// Asynchronous client that never replays cookies on its own; tests
        /// attach the session cookie explicitly.
        pub async fn untracked_async_client(self) -> AsyncClient {
            AsyncClient::untracked(self.build())
                .await
                .expect("valid Rocket instance")
        }
    }
}
