use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::upsert::excluded;
use diesel_async::{
    pooled_connection::{deadpool::Pool, AsyncDieselConnectionManager, ManagerConfig},
    AsyncConnection, AsyncPgConnection, RunQueryDsl,
};
use shared::{
    Asset, Calendar, EventRecord, EventService, Service, ServiceGroup, SyncHistory, SyncStats,
    SyncStatus, SyncType,
};
use uuid::Uuid;

use super::{CalendarUpsert, Store};
use crate::error::{StoreError, StoreResult};

pub type DbPool = Pool<AsyncPgConnection>;

async fn establish_tls_connection(config: String) -> diesel::ConnectionResult<AsyncPgConnection> {
    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    let tls = tokio_postgres_rustls::MakeRustlsConnect::new(tls_config);

    let (client, connection) = tokio_postgres::connect(&config, tls)
        .await
        .map_err(|e| diesel::ConnectionError::BadConnection(e.to_string()))?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("Connection error: {}", e);
        }
    });

    AsyncPgConnection::try_from(client).await
}

/// Open a single connection outside the pool, over TLS when `tls` is set.
pub async fn establish_connection(
    database_url: &str,
    tls: bool,
) -> diesel::ConnectionResult<AsyncPgConnection> {
    if tls {
        establish_tls_connection(database_url.to_string()).await
    } else {
        AsyncPgConnection::establish(database_url).await
    }
}

/// Build the connection pool, connecting over TLS when `tls` is set.
pub fn establish_connection_pool(database_url: &str, tls: bool) -> anyhow::Result<DbPool> {
    if database_url.is_empty() {
        anyhow::bail!("DATABASE_URL must be set");
    }

    let config = if tls {
        let mut manager_config = ManagerConfig::default();
        manager_config.custom_setup =
            Box::new(|url| Box::pin(establish_tls_connection(url.to_string())));
        AsyncDieselConnectionManager::<AsyncPgConnection>::new_with_config(
            database_url,
            manager_config,
        )
    } else {
        AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url)
    };

    let pool = Pool::builder(config).build()?;
    Ok(pool)
}

// Calendar database operations
pub mod calendars {
    use super::*;
    use crate::db::models::{CalendarRow, NewCalendar};

    pub async fn upsert(
        conn: &mut AsyncPgConnection,
        input: &CalendarUpsert,
    ) -> StoreResult<Calendar> {
        use crate::db::schema::calendars::dsl::*;

        let now = Utc::now();
        let new_calendar = NewCalendar {
            id: Uuid::new_v4(),
            remote_id: input.remote_id,
            name: input.name.clone(),
            name_translated: input.name_translated.clone(),
            color: input.color.clone(),
            is_selected: false,
            image_asset_id: input.image_asset_id,
            image_url: input.image_url.clone(),
            created_at: now,
            updated_at: now,
        };

        let row = diesel::insert_into(calendars)
            .values(&new_calendar)
            .on_conflict(remote_id)
            .do_update()
            .set((
                name.eq(excluded(name)),
                name_translated.eq(excluded(name_translated)),
                color.eq(excluded(color)),
                image_asset_id.eq(excluded(image_asset_id)),
                image_url.eq(excluded(image_url)),
                updated_at.eq(excluded(updated_at)),
            ))
            .returning(CalendarRow::as_returning())
            .get_result::<CalendarRow>(conn)
            .await?;

        Ok(row.into())
    }

    pub async fn list(conn: &mut AsyncPgConnection) -> StoreResult<Vec<Calendar>> {
        use crate::db::schema::calendars::dsl::*;

        let rows = calendars
            .order_by(name.asc())
            .select(CalendarRow::as_select())
            .load::<CalendarRow>(conn)
            .await?;

        Ok(rows.into_iter().map(Calendar::from).collect())
    }

    pub async fn selected_ids(conn: &mut AsyncPgConnection) -> StoreResult<Vec<i64>> {
        use crate::db::schema::calendars::dsl::*;

        let ids = calendars
            .filter(is_selected.eq(true))
            .order_by(remote_id.asc())
            .select(remote_id)
            .load::<i64>(conn)
            .await?;

        Ok(ids)
    }

    pub async fn set_selected(
        conn: &mut AsyncPgConnection,
        remote_id_val: i64,
        selected: bool,
    ) -> StoreResult<()> {
        use crate::db::schema::calendars::dsl::*;

        let updated = diesel::update(calendars.filter(remote_id.eq(remote_id_val)))
            .set((is_selected.eq(selected), updated_at.eq(Utc::now())))
            .execute(conn)
            .await?;

        if updated == 0 {
            return Err(StoreError::NotFound(format!("Calendar {}", remote_id_val)));
        }
        Ok(())
    }
}

// Event database operations
pub mod events {
    use super::*;
    use crate::db::models::{EventChanges, EventRow, NewEvent};

    pub async fn find_by_key(
        conn: &mut AsyncPgConnection,
        appointment: i64,
        start: DateTime<Utc>,
    ) -> StoreResult<Option<EventRecord>> {
        use crate::db::schema::events::dsl::*;

        let row = events
            .filter(appointment_id.eq(appointment))
            .filter(start_at.eq(start))
            .select(EventRow::as_select())
            .first::<EventRow>(conn)
            .await
            .optional()?;

        row.map(EventRecord::try_from).transpose()
    }

    pub async fn insert(conn: &mut AsyncPgConnection, event: &EventRecord) -> StoreResult<()> {
        use crate::db::schema::events::dsl::*;

        let new_event = NewEvent::try_from(event)?;
        diesel::insert_into(events)
            .values(&new_event)
            .execute(conn)
            .await?;

        Ok(())
    }

    pub async fn update(conn: &mut AsyncPgConnection, event: &EventRecord) -> StoreResult<()> {
        use crate::db::schema::events::dsl::*;

        let changes = EventChanges::try_from(event)?;
        let updated = diesel::update(events.filter(id.eq(event.id)))
            .set(&changes)
            .execute(conn)
            .await?;

        if updated == 0 {
            return Err(StoreError::NotFound(format!("Event {}", event.id)));
        }
        Ok(())
    }

    pub async fn list_between(
        conn: &mut AsyncPgConnection,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<EventRecord>> {
        use crate::db::schema::events::dsl::*;

        let rows = events
            .filter(start_at.ge(from))
            .filter(start_at.lt(to))
            .order_by(start_at.asc())
            .select(EventRow::as_select())
            .load::<EventRow>(conn)
            .await?;

        rows.into_iter().map(EventRecord::try_from).collect()
    }

    pub async fn count(conn: &mut AsyncPgConnection) -> StoreResult<i64> {
        use crate::db::schema::events::dsl::*;

        Ok(events.count().get_result::<i64>(conn).await?)
    }
}

// Event service assignments
pub mod event_services {
    use super::*;
    use crate::db::models::EventServiceRow;
    use diesel_async::scoped_futures::ScopedFutureExt;
    use diesel_async::AsyncConnection;

    pub async fn replace(
        conn: &mut AsyncPgConnection,
        event: Uuid,
        assignments: &[EventService],
    ) -> StoreResult<()> {
        use crate::db::schema::event_services::dsl::*;

        let rows: Vec<EventServiceRow> = assignments.iter().map(EventServiceRow::from).collect();

        conn.transaction::<_, StoreError, _>(|conn| {
            async move {
                diesel::delete(event_services.filter(event_id.eq(event)))
                    .execute(conn)
                    .await?;
                if !rows.is_empty() {
                    diesel::insert_into(event_services)
                        .values(&rows)
                        .execute(conn)
                        .await?;
                }
                Ok(())
            }
            .scope_boxed()
        })
        .await
    }

    pub async fn list_for_event(
        conn: &mut AsyncPgConnection,
        event: Uuid,
    ) -> StoreResult<Vec<EventService>> {
        use crate::db::schema::event_services::dsl::*;

        let rows = event_services
            .filter(event_id.eq(event))
            .order_by((service_id.asc(), created_at.asc()))
            .select(EventServiceRow::as_select())
            .load::<EventServiceRow>(conn)
            .await?;

        Ok(rows.into_iter().map(EventService::from).collect())
    }
}

// Service catalogue
pub mod services {
    use super::*;
    use crate::db::models::{ServiceGroupRow, ServiceRow};

    pub async fn upsert_group(conn: &mut AsyncPgConnection, group: &ServiceGroup) -> StoreResult<()> {
        use crate::db::schema::service_groups::dsl::*;

        diesel::insert_into(service_groups)
            .values(&ServiceGroupRow::from(group))
            .on_conflict(remote_id)
            .do_update()
            .set((
                name.eq(excluded(name)),
                sort_key.eq(excluded(sort_key)),
                updated_at.eq(excluded(updated_at)),
            ))
            .execute(conn)
            .await?;

        Ok(())
    }

    pub async fn upsert(conn: &mut AsyncPgConnection, service: &Service) -> StoreResult<()> {
        use crate::db::schema::services::dsl::*;

        diesel::insert_into(services)
            .values(&ServiceRow::from(service))
            .on_conflict(remote_id)
            .do_update()
            .set((
                name.eq(excluded(name)),
                service_group_id.eq(excluded(service_group_id)),
                sort_key.eq(excluded(sort_key)),
                updated_at.eq(excluded(updated_at)),
            ))
            .execute(conn)
            .await?;

        Ok(())
    }

    pub async fn list(conn: &mut AsyncPgConnection) -> StoreResult<Vec<Service>> {
        use crate::db::schema::services::dsl::*;

        let rows = services
            .order_by((sort_key.asc(), name.asc()))
            .select(ServiceRow::as_select())
            .load::<ServiceRow>(conn)
            .await?;

        Ok(rows.into_iter().map(Service::from).collect())
    }

    pub async fn list_groups(conn: &mut AsyncPgConnection) -> StoreResult<Vec<ServiceGroup>> {
        use crate::db::schema::service_groups::dsl::*;

        let rows = service_groups
            .order_by((sort_key.asc(), name.asc()))
            .select(ServiceGroupRow::as_select())
            .load::<ServiceGroupRow>(conn)
            .await?;

        Ok(rows.into_iter().map(ServiceGroup::from).collect())
    }
}

// Sync run history
pub mod sync_history {
    use super::*;
    use crate::db::models::{SyncHistoryChanges, SyncHistoryRow};

    pub async fn start(
        conn: &mut AsyncPgConnection,
        kind: SyncType,
        started: DateTime<Utc>,
    ) -> StoreResult<SyncHistory> {
        use crate::db::schema::sync_history::dsl::*;

        let history = SyncHistory {
            id: Uuid::new_v4(),
            sync_type: kind,
            status: SyncStatus::Pending,
            stats: SyncStats::default(),
            started_at: started,
            completed_at: None,
            duration_ms: None,
            error_message: None,
        };

        diesel::insert_into(sync_history)
            .values(&SyncHistoryRow::from(&history))
            .execute(conn)
            .await?;

        Ok(history)
    }

    pub async fn finish(conn: &mut AsyncPgConnection, history: &SyncHistory) -> StoreResult<()> {
        use crate::db::schema::sync_history::dsl::*;

        crate::db::ensure_terminal(history)?;

        let updated = diesel::update(sync_history.filter(id.eq(history.id)))
            .set(&SyncHistoryChanges::from(history))
            .execute(conn)
            .await?;

        if updated == 0 {
            return Err(StoreError::NotFound(format!("Sync history {}", history.id)));
        }
        Ok(())
    }

    pub async fn latest(conn: &mut AsyncPgConnection) -> StoreResult<Option<SyncHistory>> {
        use crate::db::schema::sync_history::dsl::*;

        let row = sync_history
            .order_by(started_at.desc())
            .select(SyncHistoryRow::as_select())
            .first::<SyncHistoryRow>(conn)
            .await
            .optional()?;

        Ok(row.map(SyncHistory::from))
    }

    pub async fn list(conn: &mut AsyncPgConnection, limit: i64) -> StoreResult<Vec<SyncHistory>> {
        use crate::db::schema::sync_history::dsl::*;

        let rows = sync_history
            .order_by(started_at.desc())
            .limit(limit)
            .select(SyncHistoryRow::as_select())
            .load::<SyncHistoryRow>(conn)
            .await?;

        Ok(rows.into_iter().map(SyncHistory::from).collect())
    }

    pub async fn prune(conn: &mut AsyncPgConnection, keep: i64) -> StoreResult<usize> {
        use crate::db::schema::sync_history::dsl::*;

        if keep <= 0 {
            return Ok(0);
        }

        let kept: Vec<Uuid> = sync_history
            .order_by(started_at.desc())
            .limit(keep)
            .select(id)
            .load::<Uuid>(conn)
            .await?;

        let deleted = diesel::delete(sync_history.filter(id.ne_all(kept)))
            .execute(conn)
            .await?;

        Ok(deleted)
    }
}

// Imported images
pub mod assets {
    use super::*;
    use crate::db::models::AssetRow;

    pub async fn find_by_source(
        conn: &mut AsyncPgConnection,
        url: &str,
    ) -> StoreResult<Option<Asset>> {
        use crate::db::schema::assets::dsl::*;

        let row = assets
            .filter(source_url.eq(url))
            .select(AssetRow::as_select())
            .first::<AssetRow>(conn)
            .await
            .optional()?;

        Ok(row.map(Asset::from))
    }

    pub async fn file_name_taken(conn: &mut AsyncPgConnection, name: &str) -> StoreResult<bool> {
        use crate::db::schema::assets::dsl::*;

        let taken = diesel::select(diesel::dsl::exists(assets.filter(file_name.eq(name))))
            .get_result::<bool>(conn)
            .await?;

        Ok(taken)
    }

    pub async fn insert(conn: &mut AsyncPgConnection, asset: &Asset) -> StoreResult<()> {
        use crate::db::schema::assets::dsl::*;

        diesel::insert_into(assets)
            .values(&AssetRow::from(asset))
            .execute(conn)
            .await?;

        Ok(())
    }
}

/// Postgres-backed store
#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
    database_url: String,
    tls: bool,
}

impl PgStore {
    pub fn connect(database_url: &str, tls: bool) -> anyhow::Result<Self> {
        let pool = establish_connection_pool(database_url, tls)?;
        Ok(Self {
            pool,
            database_url: database_url.to_string(),
            tls,
        })
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    // Migrations take their own connection; the harness keeps it on a blocking thread
    async fn dedicated_connection(&self) -> StoreResult<AsyncPgConnection> {
        establish_connection(&self.database_url, self.tls)
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))
    }

    /// Bring the schema up to date
    pub async fn migrate(&self) -> StoreResult<Vec<String>> {
        let conn = self.dedicated_connection().await?;
        super::migrations::run_migrations(conn).await
    }

    pub async fn pending_migrations(&self) -> StoreResult<Vec<String>> {
        let conn = self.dedicated_connection().await?;
        super::migrations::pending_migrations(conn).await
    }
}

#[async_trait]
impl Store for PgStore {
    async fn upsert_calendar(&self, calendar: &CalendarUpsert) -> StoreResult<Calendar> {
        let mut conn = self.pool.get().await?;
        calendars::upsert(&mut conn, calendar).await
    }

    async fn list_calendars(&self) -> StoreResult<Vec<Calendar>> {
        let mut conn = self.pool.get().await?;
        calendars::list(&mut conn).await
    }

    async fn selected_calendar_ids(&self) -> StoreResult<Vec<i64>> {
        let mut conn = self.pool.get().await?;
        calendars::selected_ids(&mut conn).await
    }

    async fn set_calendar_selected(&self, remote_id: i64, selected: bool) -> StoreResult<()> {
        let mut conn = self.pool.get().await?;
        calendars::set_selected(&mut conn, remote_id, selected).await
    }

    async fn find_event(
        &self,
        appointment_id: i64,
        start_at: DateTime<Utc>,
    ) -> StoreResult<Option<EventRecord>> {
        let mut conn = self.pool.get().await?;
        events::find_by_key(&mut conn, appointment_id, start_at).await
    }

    async fn insert_event(&self, event: &EventRecord) -> StoreResult<()> {
        let mut conn = self.pool.get().await?;
        events::insert(&mut conn, event).await
    }

    async fn update_event(&self, event: &EventRecord) -> StoreResult<()> {
        let mut conn = self.pool.get().await?;
        events::update(&mut conn, event).await
    }

    async fn list_events(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<EventRecord>> {
        let mut conn = self.pool.get().await?;
        events::list_between(&mut conn, from, to).await
    }

    async fn count_events(&self) -> StoreResult<i64> {
        let mut conn = self.pool.get().await?;
        events::count(&mut conn).await
    }

    async fn replace_event_services(
        &self,
        event_id: Uuid,
        services: &[EventService],
    ) -> StoreResult<()> {
        let mut conn = self.pool.get().await?;
        event_services::replace(&mut conn, event_id, services).await
    }

    async fn list_event_services(&self, event_id: Uuid) -> StoreResult<Vec<EventService>> {
        let mut conn = self.pool.get().await?;
        event_services::list_for_event(&mut conn, event_id).await
    }

    async fn upsert_service_group(&self, group: &ServiceGroup) -> StoreResult<()> {
        let mut conn = self.pool.get().await?;
        services::upsert_group(&mut conn, group).await
    }

    async fn upsert_service(&self, service: &Service) -> StoreResult<()> {
        let mut conn = self.pool.get().await?;
        services::upsert(&mut conn, service).await
    }

    async fn list_services(&self) -> StoreResult<Vec<Service>> {
        let mut conn = self.pool.get().await?;
        services::list(&mut conn).await
    }

    async fn list_service_groups(&self) -> StoreResult<Vec<ServiceGroup>> {
        let mut conn = self.pool.get().await?;
        services::list_groups(&mut conn).await
    }

    async fn start_sync(
        &self,
        sync_type: SyncType,
        started_at: DateTime<Utc>,
    ) -> StoreResult<SyncHistory> {
        let mut conn = self.pool.get().await?;
        sync_history::start(&mut conn, sync_type, started_at).await
    }

    async fn finish_sync(&self, history: &SyncHistory) -> StoreResult<()> {
        let mut conn = self.pool.get().await?;
        sync_history::finish(&mut conn, history).await
    }

    async fn latest_sync(&self) -> StoreResult<Option<SyncHistory>> {
        let mut conn = self.pool.get().await?;
        sync_history::latest(&mut conn).await
    }

    async fn list_sync_history(&self, limit: i64) -> StoreResult<Vec<SyncHistory>> {
        let mut conn = self.pool.get().await?;
        sync_history::list(&mut conn, limit).await
    }

    async fn prune_sync_history(&self, keep: i64) -> StoreResult<usize> {
        let mut conn = self.pool.get().await?;
        sync_history::prune(&mut conn, keep).await
    }

    async fn find_asset_by_source(&self, source_url: &str) -> StoreResult<Option<Asset>> {
        let mut conn = self.pool.get().await?;
        assets::find_by_source(&mut conn, source_url).await
    }

    async fn asset_file_name_taken(&self, file_name: &str) -> StoreResult<bool> {
        let mut conn = self.pool.get().await?;
        assets::file_name_taken(&mut conn, file_name).await
    }

    async fn insert_asset(&self, asset: &Asset) -> StoreResult<()> {
        let mut conn = self.pool.get().await?;
        assets::insert(&mut conn, asset).await
    }
}
