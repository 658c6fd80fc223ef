use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{Connection, Postgres, Transaction};
use tracing::debug;

use super::{AggregateTransaction, StoreError, TenantStore, SCHEMA};
use crate::models::{
    ChildRecord, Collection, CostItem, Measurement, ParseEnumError, Photo, ProjectAggregate,
    ProjectHeader, ProjectSummary, SafetyAction, StoredAggregate, migrate,
};
use crate::server::connection::{ConnectionError, Connector};
use crate::server::routing::ConnectionDescriptor;

/// Opens one dedicated Postgres connection per request.
#[derive(Debug, Default, Clone)]
pub struct PgConnector;

#[async_trait]
impl Connector for PgConnector {
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Box<dyn TenantStore>, ConnectionError> {
        let conn = PgConnection::connect_with(&connect_options(descriptor))
            .await
            .map_err(|e| ConnectionError::Failed {
                target: descriptor.to_string(),
                cause: e.to_string(),
            })?;

        Ok(Box::new(PgTenantStore { conn }))
    }
}

pub fn connect_options(descriptor: &ConnectionDescriptor) -> PgConnectOptions {
    PgConnectOptions::new()
        .host(&descriptor.host)
        .port(descriptor.port)
        .database(&descriptor.database)
        .username(&descriptor.user)
        .password(&descriptor.password)
}

/// Create the tenant tables if they do not exist yet.
pub async fn apply_schema(descriptor: &ConnectionDescriptor) -> Result<(), StoreError> {
    let mut conn = PgConnection::connect_with(&connect_options(descriptor)).await?;
    for statement in SCHEMA {
        sqlx::query(statement).execute(&mut conn).await?;
    }
    conn.close().await?;
    Ok(())
}

pub struct PgTenantStore {
    conn: PgConnection,
}

#[async_trait]
impl TenantStore for PgTenantStore {
    async fn ping(&mut self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&mut self.conn).await?;
        Ok(())
    }

    async fn list_projects(&mut self) -> Result<Vec<ProjectSummary>, StoreError> {
        let rows = sqlx::query_as::<_, SummaryRow>(
            "SELECT id, name, status, updated_at FROM projects ORDER BY updated_at DESC",
        )
        .fetch_all(&mut self.conn)
        .await?;

        rows.into_iter()
            .map(|row| row.try_into().map_err(StoreError::from))
            .collect()
    }

    async fn load_aggregate(&mut self, id: &str) -> Result<Option<ProjectAggregate>, StoreError> {
        let header = sqlx::query_as::<_, ProjectRow>("SELECT * FROM projects WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut self.conn)
            .await?;

        let Some(header) = header else {
            return Ok(None);
        };

        let mut measurements = Vec::new();
        let mut photos = Vec::new();
        let mut safety_actions = Vec::new();
        let mut cost_items = Vec::new();
        for collection in Collection::ALL {
            for child in select_children(&mut self.conn, collection, id).await? {
                match child {
                    ChildRecord::Measurement(m) => measurements.push(m),
                    ChildRecord::Photo(p) => photos.push(p),
                    ChildRecord::SafetyAction(s) => safety_actions.push(s),
                    ChildRecord::CostItem(c) => cost_items.push(c),
                }
            }
        }

        Ok(Some(migrate(StoredAggregate {
            header: header.try_into()?,
            measurements: Some(measurements),
            photos: Some(photos),
            safety_actions: Some(safety_actions),
            cost_items: Some(cost_items),
            schema_version: None,
            last_synced_at: None,
        })))
    }

    async fn create_project(&mut self, header: &ProjectHeader) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO projects (id, name, description, status, street, house_number,
                postal_code, city, latitude, longitude, staff_id, project_lead,
                created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&header.id)
        .bind(&header.name)
        .bind(&header.description)
        .bind(header.status.as_str())
        .bind(&header.street)
        .bind(&header.house_number)
        .bind(&header.postal_code)
        .bind(&header.city)
        .bind(header.latitude)
        .bind(header.longitude)
        .bind(&header.staff_id)
        .bind(&header.project_lead)
        .bind(header.created_at)
        .bind(header.updated_at)
        .execute(&mut self.conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(header.id.clone()));
        }
        Ok(())
    }

    async fn update_project(
        &mut self,
        header: &ProjectHeader,
    ) -> Result<Option<ProjectHeader>, StoreError> {
        let row = sqlx::query_as::<_, ProjectRow>(
            r#"
            UPDATE projects
            SET name = $1, description = $2, status = $3, street = $4, house_number = $5,
                postal_code = $6, city = $7, latitude = $8, longitude = $9, staff_id = $10,
                project_lead = $11, updated_at = GREATEST(NOW(), updated_at)
            WHERE id = $12
            RETURNING *
            "#,
        )
        .bind(&header.name)
        .bind(&header.description)
        .bind(header.status.as_str())
        .bind(&header.street)
        .bind(&header.house_number)
        .bind(&header.postal_code)
        .bind(&header.city)
        .bind(header.latitude)
        .bind(header.longitude)
        .bind(&header.staff_id)
        .bind(&header.project_lead)
        .bind(&header.id)
        .fetch_optional(&mut self.conn)
        .await?;

        row.map(|row| row.try_into().map_err(StoreError::from))
            .transpose()
    }

    async fn delete_project(&mut self, id: &str) -> Result<bool, StoreError> {
        let mut tx = self.conn.begin().await?;

        // Children first so no orphan survives even without the foreign keys.
        for collection in Collection::ALL {
            let sql = format!("DELETE FROM {} WHERE project_id = $1", collection.table());
            sqlx::query(&sql).bind(id).execute(&mut *tx).await?;
        }

        let result = sqlx::query("DELETE FROM projects WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_children(
        &mut self,
        collection: Collection,
        project_id: &str,
    ) -> Result<Vec<ChildRecord>, StoreError> {
        select_children(&mut self.conn, collection, project_id).await
    }

    async fn insert_child(
        &mut self,
        project_id: &str,
        child: &ChildRecord,
    ) -> Result<Option<ChildRecord>, StoreError> {
        let mut tx = self.conn.begin().await?;

        let exists: Option<String> =
            sqlx::query_scalar("SELECT id FROM projects WHERE id = $1 FOR UPDATE")
                .bind(project_id)
                .fetch_optional(&mut *tx)
                .await?;
        if exists.is_none() {
            return Ok(None);
        }

        if child_owner(&mut tx, child.collection(), child.id()).await?.is_some() {
            return Err(StoreError::Conflict(child.id().to_string()));
        }

        insert_child_row(&mut tx, project_id, child).await?;
        touch_project(&mut tx, project_id).await?;
        tx.commit().await?;

        Ok(Some(child.clone()))
    }

    async fn delete_child(
        &mut self,
        collection: Collection,
        child_id: &str,
    ) -> Result<bool, StoreError> {
        let mut tx = self.conn.begin().await?;

        let sql = format!(
            "DELETE FROM {} WHERE id = $1 RETURNING project_id",
            collection.table()
        );
        let owner: Option<String> = sqlx::query_scalar(&sql)
            .bind(child_id)
            .fetch_optional(&mut *tx)
            .await?;

        if let Some(project_id) = &owner {
            touch_project(&mut tx, project_id).await?;
        }
        tx.commit().await?;

        Ok(owner.is_some())
    }

    async fn begin(&mut self) -> Result<Box<dyn AggregateTransaction + '_>, StoreError> {
        let tx = self.conn.begin().await?;
        Ok(Box::new(PgAggregateTransaction { tx }))
    }

    async fn close(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        this.conn.close().await?;
        Ok(())
    }
}

struct PgAggregateTransaction<'c> {
    tx: Transaction<'c, Postgres>,
}

#[async_trait]
impl AggregateTransaction for PgAggregateTransaction<'_> {
    async fn upsert_header(&mut self, header: &ProjectHeader) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO projects (id, name, description, status, street, house_number,
                postal_code, city, latitude, longitude, staff_id, project_lead,
                created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                description = EXCLUDED.description,
                status = EXCLUDED.status,
                street = EXCLUDED.street,
                house_number = EXCLUDED.house_number,
                postal_code = EXCLUDED.postal_code,
                city = EXCLUDED.city,
                latitude = EXCLUDED.latitude,
                longitude = EXCLUDED.longitude,
                staff_id = EXCLUDED.staff_id,
                project_lead = EXCLUDED.project_lead,
                updated_at = GREATEST(EXCLUDED.updated_at, projects.updated_at)
            "#,
        )
        .bind(&header.id)
        .bind(&header.name)
        .bind(&header.description)
        .bind(header.status.as_str())
        .bind(&header.street)
        .bind(&header.house_number)
        .bind(&header.postal_code)
        .bind(&header.city)
        .bind(header.latitude)
        .bind(header.longitude)
        .bind(&header.staff_id)
        .bind(&header.project_lead)
        .bind(header.created_at)
        .bind(header.updated_at)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn child_owner(
        &mut self,
        collection: Collection,
        child_id: &str,
    ) -> Result<Option<String>, StoreError> {
        child_owner(&mut self.tx, collection, child_id).await
    }

    async fn update_child(&mut self, project_id: &str, child: &ChildRecord) -> Result<(), StoreError> {
        update_child_row(&mut self.tx, project_id, child).await
    }

    async fn insert_child(&mut self, project_id: &str, child: &ChildRecord) -> Result<(), StoreError> {
        insert_child_row(&mut self.tx, project_id, child).await
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        this.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        this.tx.rollback().await?;
        Ok(())
    }
}

async fn touch_project(conn: &mut PgConnection, project_id: &str) -> Result<(), StoreError> {
    sqlx::query("UPDATE projects SET updated_at = GREATEST(NOW(), updated_at) WHERE id = $1")
        .bind(project_id)
        .execute(conn)
        .await?;
    Ok(())
}

async fn child_owner(
    conn: &mut PgConnection,
    collection: Collection,
    child_id: &str,
) -> Result<Option<String>, StoreError> {
    let sql = format!(
        "SELECT project_id FROM {} WHERE id = $1 FOR UPDATE",
        collection.table()
    );
    let owner: Option<String> = sqlx::query_scalar(&sql)
        .bind(child_id)
        .fetch_optional(conn)
        .await?;
    Ok(owner)
}

async fn select_children(
    conn: &mut PgConnection,
    collection: Collection,
    project_id: &str,
) -> Result<Vec<ChildRecord>, StoreError> {
    let children: Vec<ChildRecord> = match collection {
        Collection::Measurements => sqlx::query_as::<_, MeasurementRow>(
            "SELECT * FROM measurements WHERE project_id = $1 ORDER BY recorded_at ASC, id ASC",
        )
        .bind(project_id)
        .fetch_all(conn)
        .await?
        .into_iter()
        .map(|row| ChildRecord::Measurement(row.into()))
        .collect(),
        Collection::Photos => sqlx::query_as::<_, PhotoRow>(
            "SELECT * FROM photos WHERE project_id = $1 ORDER BY taken_at ASC, id ASC",
        )
        .bind(project_id)
        .fetch_all(conn)
        .await?
        .into_iter()
        .map(|row| row.try_into().map(ChildRecord::Photo))
        .collect::<Result<_, ParseEnumError>>()?,
        Collection::SafetyActions => sqlx::query_as::<_, SafetyActionRow>(
            "SELECT * FROM safety_actions WHERE project_id = $1 ORDER BY action_date ASC, id ASC",
        )
        .bind(project_id)
        .fetch_all(conn)
        .await?
        .into_iter()
        .map(|row| row.try_into().map(ChildRecord::SafetyAction))
        .collect::<Result<_, ParseEnumError>>()?,
        Collection::CostItems => sqlx::query_as::<_, CostItemRow>(
            "SELECT * FROM cost_items WHERE project_id = $1 ORDER BY recorded_at ASC, id ASC",
        )
        .bind(project_id)
        .fetch_all(conn)
        .await?
        .into_iter()
        .map(|row| ChildRecord::CostItem(row.into()))
        .collect(),
    };

    Ok(children)
}

async fn insert_child_row(
    conn: &mut PgConnection,
    project_id: &str,
    child: &ChildRecord,
) -> Result<(), StoreError> {
    debug!(project_id, child_id = child.id(), table = child.collection().table(), "inserting child row");

    match child {
        ChildRecord::Measurement(m) => {
            sqlx::query(
                r#"
                INSERT INTO measurements (id, project_id, kind, value, unit, note, recorded_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(&m.id)
            .bind(project_id)
            .bind(&m.kind)
            .bind(&m.value)
            .bind(&m.unit)
            .bind(&m.note)
            .bind(m.timestamp)
            .execute(conn)
            .await?;
        }
        ChildRecord::Photo(p) => {
            sqlx::query(
                r#"
                INSERT INTO photos (id, project_id, uri, caption, category, taken_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(&p.id)
            .bind(project_id)
            .bind(&p.uri)
            .bind(&p.caption)
            .bind(p.category.as_str())
            .bind(p.timestamp)
            .execute(conn)
            .await?;
        }
        ChildRecord::SafetyAction(s) => {
            sqlx::query(
                r#"
                INSERT INTO safety_actions (id, project_id, action, status, responsible, action_date, note)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(&s.id)
            .bind(project_id)
            .bind(&s.action)
            .bind(s.status.as_str())
            .bind(&s.responsible)
            .bind(s.date)
            .bind(&s.note)
            .execute(conn)
            .await?;
        }
        ChildRecord::CostItem(c) => {
            sqlx::query(
                r#"
                INSERT INTO cost_items (id, project_id, position, quantity, unit, unit_price, total, note, recorded_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(&c.id)
            .bind(project_id)
            .bind(&c.position)
            .bind(c.quantity)
            .bind(&c.unit)
            .bind(c.unit_price)
            .bind(c.computed_total())
            .bind(&c.note)
            .bind(c.timestamp)
            .execute(conn)
            .await?;
        }
    }

    Ok(())
}

async fn update_child_row(
    conn: &mut PgConnection,
    project_id: &str,
    child: &ChildRecord,
) -> Result<(), StoreError> {
    match child {
        ChildRecord::Measurement(m) => {
            sqlx::query(
                r#"
                UPDATE measurements
                SET kind = $1, value = $2, unit = $3, note = $4, recorded_at = $5
                WHERE id = $6 AND project_id = $7
                "#,
            )
            .bind(&m.kind)
            .bind(&m.value)
            .bind(&m.unit)
            .bind(&m.note)
            .bind(m.timestamp)
            .bind(&m.id)
            .bind(project_id)
            .execute(conn)
            .await?;
        }
        ChildRecord::Photo(p) => {
            sqlx::query(
                r#"
                UPDATE photos
                SET uri = $1, caption = $2, category = $3, taken_at = $4
                WHERE id = $5 AND project_id = $6
                "#,
            )
            .bind(&p.uri)
            .bind(&p.caption)
            .bind(p.category.as_str())
            .bind(p.timestamp)
            .bind(&p.id)
            .bind(project_id)
            .execute(conn)
            .await?;
        }
        ChildRecord::SafetyAction(s) => {
            sqlx::query(
                r#"
                UPDATE safety_actions
                SET action = $1, status = $2, responsible = $3, action_date = $4, note = $5
                WHERE id = $6 AND project_id = $7
                "#,
            )
            .bind(&s.action)
            .bind(s.status.as_str())
            .bind(&s.responsible)
            .bind(s.date)
            .bind(&s.note)
            .bind(&s.id)
            .bind(project_id)
            .execute(conn)
            .await?;
        }
        ChildRecord::CostItem(c) => {
            sqlx::query(
                r#"
                UPDATE cost_items
                SET position = $1, quantity = $2, unit = $3, unit_price = $4, total = $5,
                    note = $6, recorded_at = $7
                WHERE id = $8 AND project_id = $9
                "#,
            )
            .bind(&c.position)
            .bind(c.quantity)
            .bind(&c.unit)
            .bind(c.unit_price)
            .bind(c.computed_total())
            .bind(&c.note)
            .bind(c.timestamp)
            .bind(&c.id)
            .bind(project_id)
            .execute(conn)
            .await?;
        }
    }

    Ok(())
}

#[derive(sqlx::FromRow, Debug)]
struct ProjectRow {
    id: String,
    name: String,
    description: String,
    status: String,
    street: String,
    house_number: String,
    postal_code: String,
    city: String,
    latitude: Option<f64>,
    longitude: Option<f64>,
    staff_id: Option<String>,
    project_lead: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ProjectRow> for ProjectHeader {
    type Error = ParseEnumError;

    fn try_from(row: ProjectRow) -> Result<Self, Self::Error> {
        Ok(ProjectHeader {
            id: row.id,
            name: row.name,
            description: row.description,
            status: row.status.parse()?,
            street: row.street,
            house_number: row.house_number,
            postal_code: row.postal_code,
            city: row.city,
            latitude: row.latitude,
            longitude: row.longitude,
            staff_id: row.staff_id,
            project_lead: row.project_lead,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow, Debug)]
struct SummaryRow {
    id: String,
    name: String,
    status: String,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SummaryRow> for ProjectSummary {
    type Error = ParseEnumError;

    fn try_from(row: SummaryRow) -> Result<Self, Self::Error> {
        Ok(ProjectSummary {
            id: row.id,
            name: row.name,
            status: row.status.parse()?,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow, Debug)]
struct MeasurementRow {
    id: String,
    kind: String,
    value: String,
    unit: Option<String>,
    note: Option<String>,
    recorded_at: DateTime<Utc>,
}

impl From<MeasurementRow> for Measurement {
    fn from(row: MeasurementRow) -> Self {
        Measurement {
            id: row.id,
            kind: row.kind,
            value: row.value,
            unit: row.unit,
            timestamp: row.recorded_at,
            note: row.note,
        }
    }
}

#[derive(sqlx::FromRow, Debug)]
struct PhotoRow {
    id: String,
    uri: String,
    caption: Option<String>,
    category: String,
    taken_at: DateTime<Utc>,
}

impl TryFrom<PhotoRow> for Photo {
    type Error = ParseEnumError;

    fn try_from(row: PhotoRow) -> Result<Self, Self::Error> {
        Ok(Photo {
            id: row.id,
            uri: row.uri,
            caption: row.caption,
            category: row.category.parse()?,
            timestamp: row.taken_at,
        })
    }
}

#[derive(sqlx::FromRow, Debug)]
struct SafetyActionRow {
    id: String,
    action: String,
    status: String,
    responsible: Option<String>,
    action_date: NaiveDate,
    note: Option<String>,
}

impl TryFrom<SafetyActionRow> for SafetyAction {
    type Error = ParseEnumError;

    fn try_from(row: SafetyActionRow) -> Result<Self, Self::Error> {
        Ok(SafetyAction {
            id: row.id,
            action: row.action,
            status: row.status.parse()?,
            responsible: row.responsible,
            date: row.action_date,
            note: row.note,
        })
    }
}

#[derive(sqlx::FromRow, Debug)]
struct CostItemRow {
    id: String,
    position: String,
    quantity: f64,
    unit: String,
    unit_price: f64,
    total: f64,
    note: Option<String>,
    recorded_at: DateTime<Utc>,
}

impl From<CostItemRow> for CostItem {
    fn from(row: CostItemRow) -> Self {
        CostItem {
            id: row.id,
            position: row.position,
            quantity: row.quantity,
            unit: row.unit,
            unit_price: row.unit_price,
            total: row.total,
            note: row.note,
            timestamp: row.recorded_at,
        }
    }
}
