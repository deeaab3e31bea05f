use sqlx::{Pool, Postgres};

pub async fn run_inline_migrations(pool: &Pool<Postgres>) {
    tracing::info!("running inline migrations");

    // Enum types first; re-creating them fails harmlessly on restart.
    let type_sql = [
        r#"CREATE TYPE vm_state AS ENUM (
            'no_vm', 'creating', 'waiting', 'resizing', 'okay', 'supersized',
            'shelved', 'error', 'missing', 'shutdown'
        )"#,
        r#"CREATE TYPE expiry_stage AS ENUM (
            'initial', 'first_warning', 'final_warning', 'expiring',
            'completed', 'failed', 'failed_retryable'
        )"#,
    ];
    for stmt in type_sql {
        let _ = sqlx::query(stmt).execute(pool).await;
    }

    let schema_sql = r#"
        CREATE TABLE IF NOT EXISTS availability_zones (
            name VARCHAR(32) PRIMARY KEY,
            network_id VARCHAR(64) NOT NULL,
            is_active BOOLEAN NOT NULL DEFAULT TRUE
        );
        CREATE TABLE IF NOT EXISTS desktop_types (
            id VARCHAR(20) PRIMARY KEY,
            name VARCHAR(64) NOT NULL,
            image_name VARCHAR(100) NOT NULL,
            default_flavor VARCHAR(64) NOT NULL,
            big_flavor VARCHAR(64) NOT NULL,
            volume_size_gb INTEGER NOT NULL DEFAULT 30,
            feature VARCHAR(32) NOT NULL,
            security_groups JSONB NOT NULL DEFAULT '[]'::jsonb,
            default_zone VARCHAR(32) NOT NULL,
            is_active BOOLEAN NOT NULL DEFAULT TRUE
        );
        CREATE TABLE IF NOT EXISTS expirations (
            id BIGSERIAL PRIMARY KEY,
            expires TIMESTAMPTZ NOT NULL,
            stage expiry_stage NOT NULL DEFAULT 'initial',
            stage_date TIMESTAMPTZ NOT NULL DEFAULT NOW()
        );
        CREATE TABLE IF NOT EXISTS volumes (
            id UUID PRIMARY KEY,
            username VARCHAR(64) NOT NULL,
            created TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            marked_for_deletion TIMESTAMPTZ,
            deleted TIMESTAMPTZ,
            error_flag TIMESTAMPTZ,
            error_message TEXT,
            expiration_id BIGINT REFERENCES expirations(id),
            image VARCHAR(100) NOT NULL,
            operating_system VARCHAR(20) NOT NULL,
            flavor VARCHAR(64) NOT NULL,
            zone VARCHAR(32) NOT NULL,
            requesting_feature VARCHAR(32) NOT NULL,
            checked_in BOOLEAN NOT NULL DEFAULT FALSE,
            ready BOOLEAN NOT NULL DEFAULT FALSE,
            hostname_id VARCHAR(6) UNIQUE,
            shelved_at TIMESTAMPTZ,
            archived_at TIMESTAMPTZ,
            backup_id VARCHAR(64),
            rebooted_at TIMESTAMPTZ
        );
        CREATE TABLE IF NOT EXISTS gateway_connections (
            id BIGSERIAL PRIMARY KEY,
            connection_name VARCHAR(128) NOT NULL,
            protocol VARCHAR(16) NOT NULL,
            created TIMESTAMPTZ NOT NULL DEFAULT NOW()
        );
        CREATE TABLE IF NOT EXISTS gateway_connection_parameters (
            connection_id BIGINT NOT NULL REFERENCES gateway_connections(id) ON DELETE CASCADE,
            parameter_name VARCHAR(64) NOT NULL,
            parameter_value VARCHAR(512) NOT NULL,
            PRIMARY KEY (connection_id, parameter_name)
        );
        CREATE TABLE IF NOT EXISTS gateway_connection_permissions (
            connection_id BIGINT NOT NULL REFERENCES gateway_connections(id) ON DELETE CASCADE,
            entity_username VARCHAR(64) NOT NULL,
            permission VARCHAR(16) NOT NULL DEFAULT 'READ',
            PRIMARY KEY (connection_id, entity_username, permission)
        );
        CREATE TABLE IF NOT EXISTS instances (
            id UUID PRIMARY KEY,
            username VARCHAR(64) NOT NULL,
            created TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            marked_for_deletion TIMESTAMPTZ,
            deleted TIMESTAMPTZ,
            error_flag TIMESTAMPTZ,
            error_message TEXT,
            expiration_id BIGINT REFERENCES expirations(id),
            boot_volume_id UUID NOT NULL REFERENCES volumes(id),
            ip_address VARCHAR(45),
            gateway_connection_id BIGINT REFERENCES gateway_connections(id) ON DELETE SET NULL,
            login_username VARCHAR(20) NOT NULL,
            login_password VARCHAR(32) NOT NULL
        );
        CREATE TABLE IF NOT EXISTS resizes (
            id BIGSERIAL PRIMARY KEY,
            instance_id UUID NOT NULL REFERENCES instances(id),
            requested TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            expiration_id BIGINT REFERENCES expirations(id),
            reverted TIMESTAMPTZ
        );
        CREATE TABLE IF NOT EXISTS vm_statuses (
            id BIGSERIAL PRIMARY KEY,
            username VARCHAR(64) NOT NULL,
            created TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            requesting_feature VARCHAR(32) NOT NULL,
            operating_system VARCHAR(20) NOT NULL,
            instance_id UUID REFERENCES instances(id),
            status vm_state NOT NULL DEFAULT 'no_vm',
            status_message TEXT,
            status_progress INTEGER NOT NULL DEFAULT 0,
            status_done TEXT,
            wait_time TIMESTAMPTZ
        );
        CREATE TABLE IF NOT EXISTS vm_status_history (
            id BIGSERIAL PRIMARY KEY,
            vm_status_id BIGINT NOT NULL REFERENCES vm_statuses(id),
            from_status vm_state NOT NULL,
            to_status vm_state NOT NULL,
            reason TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        );
        CREATE TABLE IF NOT EXISTS tasks (
            id BIGSERIAL PRIMARY KEY,
            run_at TIMESTAMPTZ NOT NULL,
            payload JSONB NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            claimed_until TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        );
        CREATE TABLE IF NOT EXISTS action_logs (
            id UUID PRIMARY KEY,
            action_type VARCHAR(64) NOT NULL,
            component VARCHAR(32) NOT NULL,
            status VARCHAR(16) NOT NULL,
            error_message TEXT,
            resource_id UUID,
            metadata JSONB,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            completed_at TIMESTAMPTZ,
            duration_ms INTEGER
        );
    "#;
    for statement in schema_sql.split(';') {
        let stmt = statement.trim();
        if !stmt.is_empty() {
            let _ = sqlx::query(stmt).execute(pool).await;
        }
    }

    let index_sql = [
        // One in-flight lifecycle per (user, desktop type, feature): a resting
        // status (no_vm / shelved) never blocks the next cycle, anything else
        // does. Insert races surface as unique violations, which the launch
        // path maps to a rejection.
        r#"CREATE UNIQUE INDEX IF NOT EXISTS vm_statuses_one_live
           ON vm_statuses (username, operating_system, requesting_feature)
           WHERE status NOT IN ('no_vm', 'shelved')"#,
        // A single current (unreverted) boost per instance.
        r#"CREATE UNIQUE INDEX IF NOT EXISTS resizes_one_current
           ON resizes (instance_id)
           WHERE reverted IS NULL"#,
        r#"CREATE INDEX IF NOT EXISTS tasks_due ON tasks (run_at)"#,
        r#"CREATE INDEX IF NOT EXISTS vm_statuses_latest
           ON vm_statuses (username, operating_system, requesting_feature, created DESC)"#,
        r#"CREATE INDEX IF NOT EXISTS action_logs_resource ON action_logs (resource_id, created_at)"#,
    ];
    for stmt in index_sql {
        let _ = sqlx::query(stmt).execute(pool).await;
    }

    // Seeds so a fresh environment can launch a desktop without manual setup.
    let seeds_sql = r#"
        INSERT INTO availability_zones (name, network_id) VALUES ('melbourne', 'replace-with-network-uuid') ON CONFLICT DO NOTHING;
        INSERT INTO desktop_types (id, name, image_name, default_flavor, big_flavor, volume_size_gb, feature, security_groups, default_zone)
            VALUES ('ubuntu', 'Ubuntu Desktop', 'desktop-ubuntu-jammy', 'm3.medium', 'm3.xlarge', 30, 'desktops', '["deskhive-desktops"]'::jsonb, 'melbourne')
            ON CONFLICT DO NOTHING;
        INSERT INTO desktop_types (id, name, image_name, default_flavor, big_flavor, volume_size_gb, feature, security_groups, default_zone)
            VALUES ('rocky', 'Rocky Linux Desktop', 'desktop-rocky-9', 'm3.medium', 'm3.xlarge', 30, 'desktops', '["deskhive-desktops"]'::jsonb, 'melbourne')
            ON CONFLICT DO NOTHING;
    "#;
    for statement in seeds_sql.split(';') {
        let stmt = statement.trim();
        if !stmt.is_empty() {
            let _ = sqlx::query(stmt).execute(pool).await;
        }
    }

    tracing::info!("inline migrations applied");
}
