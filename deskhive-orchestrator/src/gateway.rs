use anyhow::Result;
use sqlx::{Pool, Postgres};

/// Remote-desktop gateway bookkeeping: a named connection, its parameter
/// records and a permission grant for the owning user. The gateway reads
/// these tables; the orchestrator only creates and removes them.
///
/// The bare connection is created with the instance; parameters are filled
/// in when a connection URL is handed out, because the instance IP is not
/// known until the control plane has placed the server.

pub async fn create_connection(
    db: &Pool<Postgres>,
    connection_name: &str,
    protocol: &str,
) -> Result<i64> {
    let connection_id: i64 = sqlx::query_scalar(
        "INSERT INTO gateway_connections (connection_name, protocol)
         VALUES ($1, $2) RETURNING id",
    )
    .bind(connection_name)
    .bind(protocol)
    .fetch_one(db)
    .await?;
    Ok(connection_id)
}

pub async fn ensure_parameters(
    db: &Pool<Postgres>,
    connection_id: i64,
    hostname: &str,
    login_username: &str,
    login_password: &str,
    owner_username: &str,
) -> Result<()> {
    let params = [
        ("hostname", hostname),
        ("username", login_username),
        ("password", login_password),
        ("security", "tls"),
        ("ignore-cert", "true"),
        ("resize-method", "display-update"),
        ("enable-drive", "true"),
        ("drive-path", "/var/lib/gateway/shared-drive"),
        ("create-drive-path", "true"),
    ];
    for (name, value) in params {
        sqlx::query(
            "INSERT INTO gateway_connection_parameters (connection_id, parameter_name, parameter_value)
             VALUES ($1, $2, $3)
             ON CONFLICT (connection_id, parameter_name)
             DO UPDATE SET parameter_value = EXCLUDED.parameter_value",
        )
        .bind(connection_id)
        .bind(name)
        .bind(value)
        .execute(db)
        .await?;
    }

    sqlx::query(
        "INSERT INTO gateway_connection_permissions (connection_id, entity_username, permission)
         VALUES ($1, $2, 'READ')
         ON CONFLICT DO NOTHING",
    )
    .bind(connection_id)
    .bind(owner_username)
    .execute(db)
    .await?;

    Ok(())
}

/// Parameters and permissions go with the connection (ON DELETE CASCADE).
pub async fn delete_connection(db: &Pool<Postgres>, connection_id: i64) -> Result<()> {
    sqlx::query("DELETE FROM gateway_connections WHERE id = $1")
        .bind(connection_id)
        .execute(db)
        .await?;
    Ok(())
}

/// Connection URL as the web layer links it, e.g.
/// `https://gateway.dev.example.org/#/client/42`.
pub fn connection_url(site_url: &str, environment: &str, zone: &str, connection_id: i64) -> String {
    format!(
        "{}/gateway/{}-{}/#/client/{}",
        site_url.trim_end_matches('/'),
        environment,
        zone.to_lowercase(),
        connection_id
    )
}
