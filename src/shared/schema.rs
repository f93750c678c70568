diesel::table! {
    communities (id) {
        id -> Int4,
        name -> Text,
        sort_order -> Int4,
    }
}

diesel::table! {
    community_keywords (id) {
        id -> Int8,
        keywords -> Array<Text>,
        community -> Text,
        priority -> Int4,
    }
}

diesel::table! {
    community_organizations (id) {
        id -> Int8,
        community -> Text,
        org_name -> Text,
    }
}

diesel::table! {
    organizations (id) {
        id -> Uuid,
        name -> Text,
        parent_id -> Nullable<Uuid>,
    }
}

diesel::table! {
    users_profile (id) {
        id -> Int8,
        nickname -> Text,
        status -> Text,
        organization_id -> Nullable<Uuid>,
    }
}

diesel::table! {
    user_permissions (id) {
        id -> Int8,
        user_id -> Int8,
        permission -> Text,
    }
}

diesel::table! {
    sales_groups (id) {
        id -> Int8,
        groupname -> Text,
        description -> Nullable<Text>,
        members -> Array<Int8>,
        allocation_method -> Text,
        enable_quality_control -> Bool,
        daily_lead_limit -> Nullable<Int4>,
        conversion_rate_requirement -> Nullable<Float8>,
        max_pending_leads -> Nullable<Int4>,
        enable_community_matching -> Bool,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    allocation_rules (id) {
        id -> Uuid,
        name -> Text,
        description -> Nullable<Text>,
        is_active -> Bool,
        priority -> Int4,
        conditions -> Jsonb,
        user_groups -> Array<Int8>,
        allocation_method -> Nullable<Text>,
        enable_permission_check -> Bool,
        enable_community_matching -> Bool,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    leads (leadid) {
        leadid -> Text,
        phone -> Nullable<Text>,
        wechat -> Nullable<Text>,
        source -> Text,
        leadtype -> Nullable<Text>,
        campaignname -> Nullable<Text>,
        unitname -> Nullable<Text>,
        remark -> Nullable<Text>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    followups (id) {
        id -> Uuid,
        leadid -> Text,
        leadtype -> Nullable<Text>,
        followupstage -> Text,
        interviewsales_user_id -> Nullable<Int8>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    allocation_logs (id) {
        id -> Uuid,
        leadid -> Text,
        rule_id -> Nullable<Uuid>,
        rule_name -> Nullable<Text>,
        candidate_pool -> Jsonb,
        filter_trace -> Jsonb,
        assigned_user_id -> Nullable<Int8>,
        allocation_method -> Nullable<Text>,
        outcome -> Text,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    rotation_cursors (scope, scope_key) {
        scope -> Text,
        scope_key -> Text,
        position -> Int8,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    showings_queue_cards (id) {
        id -> Int8,
        user_id -> Int8,
        community -> Text,
        card_type -> Text,
        consumed -> Bool,
        consumed_at -> Nullable<Timestamptz>,
        remark -> Nullable<Text>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    showings_base_queues (id) {
        id -> Int8,
        community -> Text,
        members -> Array<Int8>,
    }
}

diesel::table! {
    showings (id) {
        id -> Uuid,
        leadid -> Nullable<Text>,
        community -> Text,
        showingsales -> Nullable<Int8>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    showings_allocation_logs (id) {
        id -> Uuid,
        community -> Text,
        assigned_user_id -> Nullable<Int8>,
        allocation_method -> Text,
        queue_type -> Nullable<Text>,
        consumed_card_ids -> Jsonb,
        quality_check -> Bool,
        created_at -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    communities,
    community_keywords,
    community_organizations,
    organizations,
    users_profile,
    user_permissions,
    sales_groups,
    allocation_rules,
    leads,
    followups,
    allocation_logs,
    rotation_cursors,
    showings_queue_cards,
    showings_base_queues,
    showings,
    showings_allocation_logs,
);
