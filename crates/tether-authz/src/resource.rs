// Canonical resource strings used in permission patterns.
use tether_common::names::{AccountName, ClusterName, ProjectName};

pub fn account_resource(account: &AccountName) -> String {
    format!("account:{account}")
}

pub fn project_resource(account: &AccountName, project: &ProjectName) -> String {
    format!("project:{account}/{project}")
}

pub fn cluster_resource(account: &AccountName, cluster: &ClusterName) -> String {
    format!("cluster:{account}/{cluster}")
}
