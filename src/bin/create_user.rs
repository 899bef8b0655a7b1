use std::io::{self, Write};

use clap::Parser;
use sqlx::postgres::PgPoolOptions;

use shop_api::auth::identity::{IdentityStore, NewIdentity, PgIdentityStore};
use shop_api::auth::passwords::PasswordService;
use shop_api::auth::responses::Role;
use shop_api::auth::service::normalize_email;

#[derive(Parser, Debug)]
#[command(
    name = "create_user",
    about = "Create a shop identity directly in the database (e.g. the first admin)"
)]
struct Args {
    /// Email address for the account (case insensitive).
    #[arg(long)]
    email: String,

    /// Plaintext password to hash and store for this identity.
    #[arg(long)]
    password: String,

    /// Optional phone number, stored unverified.
    #[arg(long)]
    phone: Option<String>,

    /// Role to assign (`buyer`, `seller` or `admin`).
    #[arg(long, default_value = "buyer")]
    role: String,

    /// Mark the email address as already confirmed.
    #[arg(long)]
    verified: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    let args = Args::parse();

    let email = match normalize_email(&args.email) {
        Ok(email) => email,
        Err(err) => {
            writeln!(io::stderr(), "error: {err}")?;
            std::process::exit(1);
        }
    };

    let Some(role) = Role::parse(&args.role) else {
        writeln!(
            io::stderr(),
            "error: unsupported role '{}'. Use 'buyer', 'seller' or 'admin'.",
            args.role
        )?;
        std::process::exit(1);
    };

    let database_url = std::env::var("DATABASE_URL")?;
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&database_url)
        .await?;
    shop_api::db::run_migrations(&pool).await?;

    let password_hash = PasswordService::new()?.hash_password(&args.password)?;

    let store = PgIdentityStore::new(pool);
    let identity = store
        .create(NewIdentity {
            email,
            phone: args.phone,
            password_hash,
            role,
        })
        .await?;

    if args.verified {
        store.mark_email_verified(identity.id).await?;
    }

    println!(
        "Created {} identity '{}' with id {}",
        identity.role.as_str(),
        identity.email,
        identity.id
    );
    Ok(())
}
