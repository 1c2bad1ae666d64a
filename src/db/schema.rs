table! {
    campaigns (id) {
        id -> Integer,
        name -> Text,
        template_id -> Nullable<Integer>,
        custom_subject -> Nullable<Text>,
        custom_message -> Nullable<Text>,
        use_custom_template -> Bool,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

table! {
    recipients (id) {
        id -> Integer,
        campaign_id -> Integer,
        email_address -> Text,
        name -> Nullable<Text>,
        added_at -> Timestamp,
    }
}

table! {
    email_templates (id) {
        id -> Integer,
        name -> Text,
        description -> Text,
        subject -> Text,
        body_kind -> Text,
        body -> Text,
        css_styles -> Text,
        is_active -> Bool,
        is_default -> Bool,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

table! {
    template_variables (id) {
        id -> Integer,
        template_id -> Integer,
        variable_name -> Text,
        display_name -> Text,
        variable_type -> Text,
        default_value -> Nullable<Text>,
        is_required -> Bool,
        description -> Text,
    }
}

joinable!(campaigns -> email_templates (template_id));
joinable!(recipients -> campaigns (campaign_id));
joinable!(template_variables -> email_templates (template_id));

allow_tables_to_appear_in_same_query!(
    campaigns,
    recipients,
    email_templates,
    template_variables,
);
