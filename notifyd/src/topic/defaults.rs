//! Topics every deployment starts with.

use crate::database::models::TopicType;

pub struct DefaultTopic {
    pub name: &'static str,
    pub topic_type: TopicType,
    pub resources: &'static [&'static str],
    pub actions: &'static [&'static str],
    pub advance_days: i64,
    pub webconsole_disable: bool,
}

const fn topic(
    name: &'static str,
    topic_type: TopicType,
    resources: &'static [&'static str],
    actions: &'static [&'static str],
) -> DefaultTopic {
    DefaultTopic {
        name,
        topic_type,
        resources,
        actions,
        advance_days: 0,
        webconsole_disable: false,
    }
}

const fn due_in(mut t: DefaultTopic, days: i64) -> DefaultTopic {
    t.advance_days = days;
    t
}

const RELEASABLE: &[&str] = &[
    "server",
    "disk",
    "eip",
    "loadbalancer",
    "dbinstance",
    "elasticcache",
];

const SYNCED: &[&str] = &[
    "server",
    "image",
    "disk",
    "snapshot",
    "network",
    "eip",
    "secgroup",
    "loadbalancer",
    "bucket",
    "dbinstance",
    "elasticcache",
    "vpc",
    "dns_zone",
    "natgateway",
    "webapp",
    "cdn_domain",
    "file_system",
    "waf",
    "kafka",
    "elasticsearch",
    "mongodb",
    "dns_recordset",
    "loadbalancerlistener",
    "loadbalancerbackendgroup",
];

pub static DEFAULT_TOPICS: &[DefaultTopic] = &[
    topic(
        "resource create or delete",
        TopicType::Resource,
        &[
            "server",
            "scalinggroup",
            "image",
            "disk",
            "snapshot",
            "instancesnapshot",
            "snapshotpolicy",
            "network",
            "eip",
            "secgroup",
            "loadbalancer",
            "loadbalanceracl",
            "loadbalancercertificate",
            "bucket",
            "dbinstance",
            "elasticcache",
            "baremetal",
            "vpc",
            "dns_zone",
            "natgateway",
            "webapp",
            "cdn_domain",
            "file_system",
            "waf",
            "kafka",
            "elasticsearch",
            "mongodb",
            "host",
        ],
        &["create", "delete", "pending_delete"],
    ),
    topic(
        "resource change config",
        TopicType::Resource,
        &["host", "server", "dbinstance", "elasticcache"],
        &["change_config"],
    ),
    topic(
        "resource update",
        TopicType::Resource,
        &["server", "dbinstance", "elasticcache", "user", "host"],
        &["update", "rebuild_root", "reset_password", "change_ipaddr"],
    ),
    topic(
        "scheduled task execute",
        TopicType::AutomatedProcess,
        &["scheduledtask"],
        &["execute"],
    ),
    topic(
        "scaling policy execute",
        TopicType::AutomatedProcess,
        &["scalingpolicy"],
        &["execute"],
    ),
    topic(
        "snapshot policy execute",
        TopicType::AutomatedProcess,
        &["snapshotpolicy"],
        &["execute"],
    ),
    topic(
        "resource operation failed",
        TopicType::Resource,
        &["server", "eip", "loadbalancer", "dbinstance", "elasticcache"],
        &[
            "create",
            "sync_status",
            "rebuild_root",
            "change_config",
            "create_backup_server",
            "delete_backup_server",
            "migrate",
        ],
    ),
    topic(
        "resource operation successed",
        TopicType::Resource,
        &["server"],
        &["create_backup_server"],
    ),
    DefaultTopic {
        webconsole_disable: true,
        ..topic(
            "resource sync",
            TopicType::Resource,
            SYNCED,
            &["sync_create", "sync_update", "sync_delete"],
        )
    },
    topic(
        "system exception event",
        TopicType::Resource,
        &["host", "task"],
        &["panic", "exception", "offline"],
    ),
    topic(
        "checksum test failed",
        TopicType::Security,
        &[
            "db_table_record",
            "vm_integrity_check",
            "cloudpods_component",
            "snapshot",
            "image",
        ],
        &["checksum_test"],
    ),
    topic("user lock", TopicType::Security, &["user"], &["lock"]),
    topic(
        "action log exceed count",
        TopicType::Resource,
        &["action_log"],
        &["exceed_count"],
    ),
    topic(
        "cloud account sync status",
        TopicType::AutomatedProcess,
        &["account_status"],
        &["sync_account_status"],
    ),
    topic(
        "net out of sync",
        TopicType::AutomatedProcess,
        &["net"],
        &["net_out_of_sync"],
    ),
    topic(
        "mysql out of sync",
        TopicType::AutomatedProcess,
        &["dbinstance"],
        &["mysql_out_of_sync"],
    ),
    topic(
        "service abnormal",
        TopicType::AutomatedProcess,
        &["service"],
        &["service_abnormal"],
    ),
    topic(
        "server panicked",
        TopicType::Resource,
        &["server"],
        &["server_panicked"],
    ),
    due_in(
        topic(
            "password expire due 1 day",
            TopicType::Security,
            &["user"],
            &["password_expire_soon"],
        ),
        1,
    ),
    due_in(
        topic(
            "password expire due 7 day",
            TopicType::Security,
            &["user"],
            &["password_expire_soon"],
        ),
        7,
    ),
    due_in(
        topic(
            "resource release due 1 day",
            TopicType::Resource,
            RELEASABLE,
            &["expired_release"],
        ),
        1,
    ),
    due_in(
        topic(
            "resource release due 3 day",
            TopicType::Resource,
            RELEASABLE,
            &["expired_release"],
        ),
        3,
    ),
    due_in(
        topic(
            "resource release due 30 day",
            TopicType::Resource,
            RELEASABLE,
            &["expired_release"],
        ),
        30,
    ),
];
