//! Robot recipients: vendor chat bots and generic webhooks.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use crate::database::models::RobotDbModel;
use crate::database::repositories::{RobotRepository, SubscriberRepository};
use crate::notification::channels::{DriverRegistry, Recipient, SendParams};
use crate::{Error, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RobotCreate {
    pub name: String,
    pub robot_type: String,
    pub address: String,
    pub lang: String,
    pub domain_id: String,
    #[serde(default)]
    pub header: HashMap<String, String>,
    #[serde(default)]
    pub body: Map<String, Value>,
    #[serde(default)]
    pub msg_key: String,
}

pub struct RobotService {
    repo: Arc<dyn RobotRepository>,
    subscribers: Arc<dyn SubscriberRepository>,
    drivers: Arc<DriverRegistry>,
}

impl RobotService {
    pub fn new(
        repo: Arc<dyn RobotRepository>,
        subscribers: Arc<dyn SubscriberRepository>,
        drivers: Arc<DriverRegistry>,
    ) -> Self {
        Self {
            repo,
            subscribers,
            drivers,
        }
    }

    /// Probe the address through its driver, then insert.
    pub async fn create_robot(&self, request: RobotCreate) -> Result<RobotDbModel> {
        if request.address.is_empty() {
            return Err(Error::input_invalid("robot address is required"));
        }
        let driver = self.drivers.get(&request.robot_type)?;
        if !driver.capabilities().is_robot {
            return Err(Error::input_invalid(format!(
                "'{}' is not a robot channel",
                request.robot_type
            )));
        }

        let probe = SendParams {
            receivers: vec![Recipient::new(&request.address, &request.domain_id)],
            topic: "robot probe".to_string(),
            title: "Robot verification".to_string(),
            message: format!("This is a verifying message for robot {}", request.name),
            event: "robot/probe".to_string(),
            header: request.header.clone(),
            body: request.body.clone(),
            msg_key: request.msg_key.clone(),
            ..Default::default()
        };
        driver.send(&probe).await?;

        let mut robot = RobotDbModel::new(
            request.name,
            request.robot_type,
            request.address,
            request.domain_id,
        );
        robot.lang = request.lang;
        robot.msg_key = request.msg_key;
        if !request.header.is_empty() {
            robot.header = Some(serde_json::to_string(&request.header)?);
        }
        if !request.body.is_empty() {
            robot.body = Some(serde_json::to_string(&request.body)?);
        }
        self.repo.create_robot(&robot).await?;
        info!(robot_id = %robot.id, robot_type = %robot.robot_type, "Created robot");
        Ok(robot)
    }

    pub async fn get_robot(&self, id: &str) -> Result<RobotDbModel> {
        self.repo.get_robot(id).await
    }

    pub async fn list_by_ids(&self, ids: &[String]) -> Result<Vec<RobotDbModel>> {
        self.repo.list_by_ids(ids).await
    }

    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<RobotDbModel> {
        let mut robot = self.repo.get_robot(id).await?;
        robot.enabled = enabled;
        self.repo.update_robot(&robot).await?;
        Ok(robot)
    }

    /// Delete the robot and every subscriber pointing at it.
    pub async fn delete_robot(&self, id: &str) -> Result<()> {
        let removed = self.subscribers.delete_by_robot(id).await?;
        self.repo.delete_robot(id).await?;
        info!(robot_id = id, subscribers_removed = removed, "Deleted robot");
        Ok(())
    }
}
