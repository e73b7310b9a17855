diesel::table! {
    orders (id) {
        id -> Uuid,
        user_id -> Uuid,
        amount -> Numeric,
        description -> Nullable<Varchar>,
        status -> Varchar,
        failure_reason -> Nullable<Varchar>,
        created_at -> Timestamptz,
        updated_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    outbox_messages (id) {
        id -> Uuid,
        kind -> Varchar,
        payload -> Jsonb,
        created_at -> Timestamptz,
        processed_at -> Nullable<Timestamptz>,
        last_error -> Nullable<Text>,
        retry_count -> Int4,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    orders,
    outbox_messages,
);
