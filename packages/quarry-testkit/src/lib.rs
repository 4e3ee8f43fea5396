//! Scratch databases and collections for integration tests that need real engines.
//!
//! Tests opt in through `QUARRY_PG_DSN` and `QUARRY_QDRANT_URL`; without them they skip.

mod error;

pub use error::{Error, Result};

use std::{env, str::FromStr, thread, time::Duration};

use qdrant_client::Qdrant;
use sqlx::{
	ConnectOptions, Connection, Executor,
	postgres::{PgConnectOptions, PgConnection},
};
use tokio::{runtime::Builder, time};
use uuid::Uuid;

const ADMIN_DATABASES: [&str; 2] = ["postgres", "template1"];
const QDRANT_TIMEOUT: Duration = Duration::from_secs(10);

pub fn env_dsn() -> Option<String> {
	env::var("QUARRY_PG_DSN").ok().filter(|value| !value.trim().is_empty())
}

pub fn env_qdrant_url() -> Option<String> {
	env::var("QUARRY_QDRANT_URL").ok().filter(|value| !value.trim().is_empty())
}

/// A throwaway Postgres database, dropped on [`TestDatabase::cleanup`] or on drop.
pub struct TestDatabase {
	name: String,
	dsn: String,
	admin_options: PgConnectOptions,
	cleaned: bool,
}
impl TestDatabase {
	pub async fn new(base_dsn: &str) -> Result<Self> {
		let base_options = PgConnectOptions::from_str(base_dsn)
			.map_err(|err| Error::Setup(format!("Failed to parse QUARRY_PG_DSN: {err}.")))?;
		let (admin_options, mut admin_conn) = connect_admin(&base_options).await?;
		let name = format!("quarry_test_{}", Uuid::new_v4().simple());

		admin_conn
			.execute(format!(r#"CREATE DATABASE "{name}""#).as_str())
			.await
			.map_err(|err| Error::Setup(format!("Failed to create test database: {err}.")))?;

		let dsn = base_options.database(&name).to_url_lossy().to_string();

		Ok(Self { name, dsn, admin_options, cleaned: false })
	}

	pub fn dsn(&self) -> &str {
		&self.dsn
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub async fn cleanup(mut self) -> Result<()> {
		drop_database(&self.name, &self.admin_options).await?;

		self.cleaned = true;

		Ok(())
	}
}
impl Drop for TestDatabase {
	fn drop(&mut self) {
		if self.cleaned {
			return;
		}

		let name = self.name.clone();
		let admin_options = self.admin_options.clone();
		let cleanup = thread::spawn(move || {
			let runtime = match Builder::new_current_thread().enable_all().build() {
				Ok(runtime) => runtime,
				Err(err) => {
					eprintln!("Test database cleanup failed: {err}.");

					return;
				},
			};

			if let Err(err) = runtime.block_on(drop_database(&name, &admin_options)) {
				eprintln!("Test database cleanup failed: {err}.");
			}
		});
		let _ = cleanup.join();
	}
}

/// A uniquely named Qdrant collection, deleted on [`TestCollection::cleanup`].
pub struct TestCollection {
	pub url: String,
	pub name: String,
}
impl TestCollection {
	pub fn new(url: &str, prefix: &str) -> Self {
		Self { url: url.to_string(), name: format!("{prefix}_{}", Uuid::new_v4().simple()) }
	}

	pub async fn cleanup(self) -> Result<()> {
		let client = Qdrant::from_url(&self.url).build()?;
		let exists = time::timeout(QDRANT_TIMEOUT, client.collection_exists(self.name.clone()))
			.await
			.map_err(|_| Error::Timeout {
				operation: "collection_exists",
				seconds: QDRANT_TIMEOUT.as_secs(),
			})??;

		if exists {
			time::timeout(QDRANT_TIMEOUT, client.delete_collection(self.name.clone()))
				.await
				.map_err(|_| Error::Timeout {
					operation: "delete_collection",
					seconds: QDRANT_TIMEOUT.as_secs(),
				})??;
		}

		Ok(())
	}
}

async fn connect_admin(
	base_options: &PgConnectOptions,
) -> Result<(PgConnectOptions, PgConnection)> {
	let mut last_err = None;

	for database in ADMIN_DATABASES {
		let options = base_options.clone().database(database);

		match PgConnection::connect_with(&options).await {
			Ok(conn) => return Ok((options, conn)),
			Err(err) => last_err = Some(err),
		}
	}

	Err(Error::Setup(format!("Failed to connect to an admin database: {last_err:?}.")))
}

async fn drop_database(name: &str, admin_options: &PgConnectOptions) -> Result<()> {
	let mut conn = PgConnection::connect_with(admin_options).await.map_err(|err| {
		Error::Setup(format!("Failed to connect to admin database for cleanup: {err}."))
	})?;
	let _ = sqlx::query(
		"\
SELECT pg_terminate_backend(pid)
FROM pg_stat_activity
WHERE datname = $1 AND pid <> pg_backend_pid()",
	)
	.bind(name)
	.fetch_all(&mut conn)
	.await;

	conn.execute(format!(r#"DROP DATABASE IF EXISTS "{name}""#).as_str())
		.await
		.map_err(|err| Error::Setup(format!("Failed to drop test database: {err}.")))?;

	Ok(())
}
