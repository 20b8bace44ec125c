use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct App {
    pub name: String,
    pub user_friendly_name: String,
    pub project_url: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppVersion {
    pub app_name: String,
    pub version_num: i32,
    pub platform: String,
    pub avg_ncpus: f64,
    pub flops: f64,
    /// Name of the executable FileInfo within the same project.
    pub exec_file: String,
    pub project_url: String,
}

impl AppVersion {
    /// Key in the client-wide app-version map. Versions are scoped by
    /// project and app; the same app name on two projects is distinct.
    pub fn key(project_url: &str, app_name: &str, version_num: i32) -> String {
        format!("{}//{}//{}", project_url, app_name, version_num)
    }
}
