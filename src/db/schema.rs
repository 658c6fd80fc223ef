/// Tables for one tenant database. Every statement is idempotent.
pub const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS projects (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        status TEXT NOT NULL DEFAULT 'active',
        street TEXT NOT NULL DEFAULT '',
        house_number TEXT NOT NULL DEFAULT '',
        postal_code TEXT NOT NULL DEFAULT '',
        city TEXT NOT NULL DEFAULT '',
        latitude DOUBLE PRECISION,
        longitude DOUBLE PRECISION,
        staff_id TEXT,
        project_lead TEXT,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS measurements (
        id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL REFERENCES projects (id) ON DELETE CASCADE,
        kind TEXT NOT NULL,
        value TEXT NOT NULL,
        unit TEXT,
        note TEXT,
        recorded_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS photos (
        id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL REFERENCES projects (id) ON DELETE CASCADE,
        uri TEXT NOT NULL,
        caption TEXT,
        category TEXT NOT NULL DEFAULT 'other',
        taken_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS safety_actions (
        id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL REFERENCES projects (id) ON DELETE CASCADE,
        action TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'planned',
        responsible TEXT,
        action_date DATE NOT NULL,
        note TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS cost_items (
        id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL REFERENCES projects (id) ON DELETE CASCADE,
        position TEXT NOT NULL,
        quantity DOUBLE PRECISION NOT NULL,
        unit TEXT NOT NULL DEFAULT '',
        unit_price DOUBLE PRECISION NOT NULL,
        total DOUBLE PRECISION NOT NULL,
        note TEXT,
        recorded_at TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS measurements_project_idx ON measurements (project_id)",
    "CREATE INDEX IF NOT EXISTS photos_project_idx ON photos (project_id)",
    "CREATE INDEX IF NOT EXISTS safety_actions_project_idx ON safety_actions (project_id)",
    "CREATE INDEX IF NOT EXISTS cost_items_project_idx ON cost_items (project_id)",
];
