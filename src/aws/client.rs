//! SDK clients for one customer account and region.
//!
//! Credentials come from the operator's default chain (IRSA, EKS Pod Identity, instance
//! profile, env vars). A `DataPlane` with `assumeRoleArn` gets clients whose credentials
//! are refreshed through STS `AssumeRole` by the SDK itself.

use std::time::Duration;

use aws_config::timeout::TimeoutConfig;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_sdk_ec2::Client as Ec2Client;
use aws_sdk_eks::Client as EksSdkClient;
use aws_sdk_iam::Client as IamClient;
use tracing::{debug, info};

/// Session name shown in the customer's CloudTrail for assumed-role calls.
const SESSION_NAME: &str = "dpo-operator";

/// Account and region a set of clients is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey {
    pub region: String,
    pub assume_role_arn: Option<String>,
}

#[derive(Clone)]
pub struct AwsClients {
    pub eks: EksSdkClient,
    pub ec2: Ec2Client,
    pub iam: IamClient,
    pub region: String,
    config: SdkConfig,
}

impl AwsClients {
    /// Every provider call made through the clients is bounded by `operation_timeout`.
    pub async fn new(key: &ClientKey, operation_timeout: Duration) -> Self {
        let timeouts = TimeoutConfig::builder()
            .operation_timeout(operation_timeout)
            .build();
        let region = Region::new(key.region.clone());

        let base = aws_config::defaults(BehaviorVersion::latest())
            .region(region.clone())
            .timeout_config(timeouts.clone())
            .load()
            .await;

        let config = match &key.assume_role_arn {
            None => {
                debug!("Loaded default credential chain for {}", key.region);
                base
            }
            Some(role_arn) => {
                info!("Assuming role {} in {}", role_arn, key.region);
                let provider = aws_config::sts::AssumeRoleProvider::builder(role_arn)
                    .configure(&base)
                    .region(region.clone())
                    .session_name(SESSION_NAME)
                    .build()
                    .await;
                aws_config::defaults(BehaviorVersion::latest())
                    .region(region)
                    .credentials_provider(provider)
                    .timeout_config(timeouts)
                    .load()
                    .await
            }
        };

        Self {
            eks: EksSdkClient::new(&config),
            ec2: Ec2Client::new(&config),
            iam: IamClient::new(&config),
            region: key.region.clone(),
            config,
        }
    }

    /// SDK config carrying the (possibly assumed) credentials provider.
    pub const fn sdk_config(&self) -> &SdkConfig {
        &self.config
    }
}
