diesel::table! {
    accounts (id) {
        id -> Uuid,
        user_id -> Uuid,
        balance -> Numeric,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
        version -> Int4,
    }
}

diesel::table! {
    transactions (id) {
        id -> Uuid,
        account_id -> Uuid,
        order_id -> Nullable<Uuid>,
        kind -> Varchar,
        amount -> Numeric,
        description -> Nullable<Varchar>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    inbox_messages (message_id) {
        message_id -> Uuid,
        kind -> Varchar,
        payload -> Jsonb,
        received_at -> Timestamptz,
        processed_at -> Nullable<Timestamptz>,
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
    accounts,
    transactions,
    inbox_messages,
    outbox_messages,
);
