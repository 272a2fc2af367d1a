use diesel::{allow_tables_to_appear_in_same_query, joinable, table};
use diesel::sql_types::*;

table! {
    use super::*;

    drs_files (id) {
        id -> Integer,
        night -> Integer,
        run_id -> Integer,
        available -> Bool,
        roi -> Integer,
        drs_step -> Integer,
    }
}

table! {
    use super::*;

    jars (id) {
        id -> Integer,
        version -> Text,
        jar_file -> Binary,
    }
}

table! {
    use super::*;

    jobs (id) {
        id -> Integer,
        raw_data_file_id -> Integer,
        drs_file_id -> Integer,
        jar_id -> Integer,
        xml_id -> Integer,
        result_file -> Nullable<Text>,
        status_id -> Integer,
        priority -> Integer,
        walltime -> Integer,
        md5hash -> Nullable<Text>,
    }
}

table! {
    use super::*;

    processing_states (id) {
        id -> Integer,
        description -> Text,
    }
}

table! {
    use super::*;

    raw_data_files (id) {
        id -> Integer,
        night -> Integer,
        run_id -> Integer,
        available -> Bool,
        roi -> Integer,
        run_type_key -> Integer,
        run_type_name -> Text,
    }
}

table! {
    use super::*;

    xmls (id) {
        id -> Integer,
        name -> Text,
        content -> Text,
        comment -> Text,
        jar_id -> Integer,
    }
}

joinable!(jobs -> drs_files (drs_file_id));
joinable!(jobs -> jars (jar_id));
joinable!(jobs -> processing_states (status_id));
joinable!(jobs -> raw_data_files (raw_data_file_id));
joinable!(jobs -> xmls (xml_id));
joinable!(xmls -> jars (jar_id));

allow_tables_to_appear_in_same_query!(
    drs_files,
    jars,
    jobs,
    processing_states,
    raw_data_files,
    xmls,
);
