// Kept in step with the SQL in `migrations.rs`.

diesel::table! {
    assets (id) {
        id -> Uuid,
        file_name -> Varchar,
        local_path -> Text,
        source_url -> Text,
        content_type -> Varchar,
        byte_size -> Int8,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    calendars (id) {
        id -> Uuid,
        remote_id -> Int8,
        name -> Varchar,
        name_translated -> Nullable<Varchar>,
        color -> Nullable<Varchar>,
        is_selected -> Bool,
        image_asset_id -> Nullable<Uuid>,
        image_url -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    event_services (id) {
        id -> Uuid,
        event_id -> Uuid,
        service_id -> Int8,
        service_name -> Varchar,
        person_name -> Nullable<Varchar>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    events (id) {
        id -> Uuid,
        event_id -> Nullable<Int8>,
        appointment_id -> Int8,
        calendar_id -> Int8,
        title -> Varchar,
        series_description -> Nullable<Text>,
        occurrence_description -> Nullable<Text>,
        start_at -> Timestamptz,
        end_at -> Timestamptz,
        is_all_day -> Bool,
        address_name -> Nullable<Varchar>,
        address_street -> Nullable<Varchar>,
        address_zip -> Nullable<Varchar>,
        address_city -> Nullable<Varchar>,
        address_latitude -> Nullable<Varchar>,
        address_longitude -> Nullable<Varchar>,
        tags -> Text,
        status -> Nullable<Varchar>,
        image_asset_id -> Nullable<Uuid>,
        image_url -> Nullable<Text>,
        series_modified_at -> Nullable<Timestamptz>,
        occurrence_modified_at -> Nullable<Timestamptz>,
        raw_payload -> Text,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    service_groups (remote_id) {
        remote_id -> Int8,
        name -> Varchar,
        sort_key -> Int4,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    services (remote_id) {
        remote_id -> Int8,
        name -> Varchar,
        service_group_id -> Nullable<Int8>,
        is_selected -> Bool,
        sort_key -> Int4,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    sync_history (id) {
        id -> Uuid,
        sync_type -> Varchar,
        status -> Varchar,
        calendars_processed -> Int4,
        events_found -> Int4,
        events_inserted -> Int4,
        events_updated -> Int4,
        events_skipped -> Int4,
        services_imported -> Int4,
        started_at -> Timestamptz,
        completed_at -> Nullable<Timestamptz>,
        duration_ms -> Nullable<Int8>,
        error_message -> Nullable<Text>,
    }
}

diesel::joinable!(event_services -> events (event_id));

diesel::allow_tables_to_appear_in_same_query!(
    assets,
    calendars,
    event_services,
    events,
    service_groups,
    services,
    sync_history,
);
