//! Network provisioning: VPC, gateways, route tables, subnets, security group and NAT.
//!
//! Each step is guarded by the status field it fills and persists that field as soon as
//! the provider accepts the create call. Follow-up calls on a created resource (attaching,
//! routing, enabling attributes) are steps of their own with a flag of their own, so a
//! failure after a create never loses the id. A crash between steps resumes at the first
//! step whose field is still empty.

use anyhow::Result;
use tracing::{debug, info};

use super::{Pass, Step};
use crate::cloud::SubnetRequest;
use crate::crd::NetworkMode;
use crate::ec2::Ipv4Block;
use crate::error::DpoError;

pub async fn reconcile(pass: &mut Pass<'_>) -> Result<Step> {
    if pass.spec().network.mode == NetworkMode::BringYourOwn {
        return adopt(pass).await;
    }

    let (vpc_id, block) = ensure_vpc(pass).await?;
    ensure_dns_hostnames(pass, &vpc_id).await?;
    let igw_id = ensure_internet_gateway(pass, &vpc_id).await?;
    let route_table_id = ensure_public_route_table(pass, &vpc_id, &igw_id).await?;
    ensure_subnets(pass, &vpc_id, block).await?;
    configure_public_subnets(pass, &route_table_id).await?;
    ensure_security_group(pass, &vpc_id, block).await?;
    let nat_id = ensure_nat_gateway(pass).await?;
    ensure_nat_routes(pass, &vpc_id, &route_table_id, &nat_id).await?;

    Ok(Step::Ready)
}

/// Bring-your-own networks are recorded as supplied and never modified.
async fn adopt(pass: &mut Pass<'_>) -> Result<Step> {
    let subnet_ids = pass.spec().network.subnet_ids.clone();
    let security_group_ids = pass.spec().network.security_group_ids.clone();

    let changed = pass
        .patch(|s| {
            let infra = &mut s.cloud_infra_status;
            if infra.subnet_ids.is_empty() {
                infra.subnet_ids.clone_from(&subnet_ids);
            }
            if infra.security_group_ids.is_empty() {
                infra.security_group_ids.clone_from(&security_group_ids);
            }
        })
        .await?;
    if changed {
        info!(
            "Adopted {} subnets and {} security groups for {}",
            subnet_ids.len(),
            security_group_ids.len(),
            pass.name()
        );
    }
    Ok(Step::Ready)
}

async fn ensure_vpc(pass: &mut Pass<'_>) -> Result<(String, Ipv4Block)> {
    let infra = &pass.status().cloud_infra_status;
    if let Some(vpc_id) = infra.vpc.clone() {
        let cidr = infra
            .vpc_cidr
            .as_deref()
            .ok_or_else(|| DpoError::missing("network", "vpcCidr"))?;
        return Ok((vpc_id, Ipv4Block::parse(cidr)?));
    }

    let block = match &pass.spec().network.cidr {
        Some(cidr) => Ipv4Block::parse(cidr)?,
        None => Ipv4Block::random_private(),
    };
    let cidr = block.to_string();
    let vpc_id = pass
        .cloud
        .network
        .create_vpc(&format!("{}-vpc", pass.name()), &cidr)
        .await?;
    pass.record_create("vpc");
    info!("Created VPC {} ({}) for {}", vpc_id, cidr, pass.name());

    pass.patch(|s| {
        let infra = &mut s.cloud_infra_status;
        if infra.vpc.is_none() {
            infra.vpc = Some(vpc_id.clone());
            infra.vpc_cidr = Some(cidr.clone());
        }
    })
    .await?;

    // A concurrent writer may have won; continue with whatever got persisted.
    let infra = &pass.status().cloud_infra_status;
    match (&infra.vpc, &infra.vpc_cidr) {
        (Some(vpc), Some(cidr)) => Ok((vpc.clone(), Ipv4Block::parse(cidr)?)),
        _ => Err(DpoError::missing("network", "vpc").into()),
    }
}

async fn ensure_dns_hostnames(pass: &mut Pass<'_>, vpc_id: &str) -> Result<()> {
    if pass.status().cloud_infra_status.dns_hostnames_enabled {
        return Ok(());
    }
    pass.cloud.network.enable_dns_hostnames(vpc_id).await?;
    debug!("Enabled DNS hostnames on {}", vpc_id);
    pass.patch(|s| s.cloud_infra_status.dns_hostnames_enabled = true)
        .await?;
    Ok(())
}

async fn ensure_internet_gateway(pass: &mut Pass<'_>, vpc_id: &str) -> Result<String> {
    let id = match pass.status().cloud_infra_status.internet_gateway_id.clone() {
        Some(id) => id,
        None => {
            let id = pass
                .cloud
                .network
                .create_internet_gateway(&format!("{}-igw", pass.name()))
                .await?;
            pass.record_create("internet-gateway");
            info!("Created internet gateway {} for {}", id, pass.name());

            pass.patch(|s| {
                s.cloud_infra_status
                    .internet_gateway_id
                    .get_or_insert_with(|| id.clone());
            })
            .await?;
            pass.status()
                .cloud_infra_status
                .internet_gateway_id
                .clone()
                .unwrap_or(id)
        }
    };

    if !pass.status().cloud_infra_status.internet_gateway_attached {
        pass.cloud
            .network
            .attach_internet_gateway(&id, vpc_id)
            .await?;
        info!("Attached internet gateway {} to {}", id, vpc_id);
        pass.patch(|s| s.cloud_infra_status.internet_gateway_attached = true)
            .await?;
    }
    Ok(id)
}

async fn ensure_public_route_table(
    pass: &mut Pass<'_>,
    vpc_id: &str,
    igw_id: &str,
) -> Result<String> {
    let id = match pass.status().cloud_infra_status.public_route_table_id.clone() {
        Some(id) => id,
        None => {
            let id = pass
                .cloud
                .network
                .create_route_table(&format!("{}-public", pass.name()), vpc_id)
                .await?;
            pass.record_create("route-table");
            info!("Created public route table {} for {}", id, pass.name());

            pass.patch(|s| {
                s.cloud_infra_status
                    .public_route_table_id
                    .get_or_insert_with(|| id.clone());
            })
            .await?;
            pass.status()
                .cloud_infra_status
                .public_route_table_id
                .clone()
                .unwrap_or(id)
        }
    };

    if !pass.status().cloud_infra_status.public_route_added {
        pass.cloud.network.add_internet_route(&id, igw_id).await?;
        debug!("Routed {} through {}", id, igw_id);
        pass.patch(|s| s.cloud_infra_status.public_route_added = true)
            .await?;
    }
    Ok(id)
}

/// Create subnets one at a time until the required AZ count is reached.
///
/// Subnet `i` takes the `i`-th /20 slice and the `i mod zones`-th zone; odd indices are public.
async fn ensure_subnets(pass: &mut Pass<'_>, vpc_id: &str, block: Ipv4Block) -> Result<()> {
    let required = pass.engine.settings.required_azs;
    if pass.status().cloud_infra_status.subnet_ids.len() >= required {
        return Ok(());
    }

    let zones = pass.cloud.network.availability_zones().await?;
    if zones.is_empty() {
        return Err(DpoError::missing("network", "availability zones").into());
    }
    debug!("Spreading subnets of {} across {:?}", pass.name(), zones);

    while pass.status().cloud_infra_status.subnet_ids.len() < required {
        let index = pass.status().cloud_infra_status.subnet_ids.len();
        let cidr = block.subnet(index).ok_or_else(|| {
            DpoError::InvalidSpec(format!("VPC block {block} cannot hold subnet {index}"))
        })?;
        let public = index % 2 == 1;
        let request = SubnetRequest {
            name: format!(
                "{}-{}-{}",
                pass.name(),
                if public { "public" } else { "private" },
                index
            ),
            vpc_id: vpc_id.to_string(),
            cidr: cidr.to_string(),
            availability_zone: zones[index % zones.len()].clone(),
            public,
            cluster_name: pass.cluster_name().to_string(),
        };

        let id = pass.cloud.network.create_subnet(&request).await?;
        pass.record_create("subnet");
        info!(
            "Created subnet {} ({} in {}) for {}",
            id,
            request.cidr,
            request.availability_zone,
            pass.name()
        );

        pass.patch(|s| {
            let ids = &mut s.cloud_infra_status.subnet_ids;
            if !ids.contains(&id) && ids.len() < required {
                ids.push(id.clone());
            }
        })
        .await?;
    }
    Ok(())
}

/// Public subnets are the odd entries of the subnet list.
async fn configure_public_subnets(pass: &mut Pass<'_>, route_table_id: &str) -> Result<()> {
    let pending: Vec<String> = {
        let infra = &pass.status().cloud_infra_status;
        infra
            .subnet_ids
            .iter()
            .skip(1)
            .step_by(2)
            .filter(|id| !infra.public_subnets_configured.contains(id))
            .cloned()
            .collect()
    };

    for subnet_id in pending {
        pass.cloud
            .network
            .configure_public_subnet(&subnet_id, route_table_id)
            .await?;
        debug!("Joined {} to public route table {}", subnet_id, route_table_id);
        pass.patch(|s| {
            let configured = &mut s.cloud_infra_status.public_subnets_configured;
            if !configured.contains(&subnet_id) {
                configured.push(subnet_id.clone());
            }
        })
        .await?;
    }
    Ok(())
}

async fn ensure_security_group(pass: &mut Pass<'_>, vpc_id: &str, block: Ipv4Block) -> Result<()> {
    let sg_id = match pass.status().cloud_infra_status.security_group_ids.first() {
        Some(id) => id.clone(),
        None => {
            let id = pass
                .cloud
                .network
                .create_security_group(&format!("{}-cluster", pass.name()), vpc_id)
                .await?;
            pass.record_create("security-group");
            info!("Created security group {} for {}", id, pass.name());

            pass.patch(|s| {
                let ids = &mut s.cloud_infra_status.security_group_ids;
                if ids.is_empty() {
                    ids.push(id.clone());
                }
            })
            .await?;
            pass.status()
                .cloud_infra_status
                .security_group_ids
                .first()
                .cloned()
                .unwrap_or(id)
        }
    };

    if !pass.status().cloud_infra_status.inbound_rule_added {
        pass.cloud
            .network
            .authorize_ingress(&sg_id, &block.to_string())
            .await?;
        info!("Allowed inbound traffic from {} on {}", block, sg_id);
        pass.patch(|s| s.cloud_infra_status.inbound_rule_added = true)
            .await?;
    }
    Ok(())
}

/// The NAT gateway lives in the first public subnet.
///
/// The elastic IP is persisted before the gateway is requested so a failed gateway create
/// reuses it on the next pass.
async fn ensure_nat_gateway(pass: &mut Pass<'_>) -> Result<String> {
    let infra = &pass.status().cloud_infra_status;
    if let Some(id) = infra.nat_gateway_id.clone() {
        return Ok(id);
    }
    let subnet_id = infra
        .subnet_ids
        .get(1)
        .or_else(|| infra.subnet_ids.first())
        .cloned()
        .ok_or_else(|| DpoError::missing("network", "subnet for the NAT gateway"))?;
    let name = format!("{}-nat", pass.name());

    let allocation_id = match infra.nat_allocation_id.clone() {
        Some(id) => id,
        None => {
            let id = pass.cloud.network.allocate_address(&name).await?;
            pass.record_create("elastic-ip");
            info!("Allocated elastic IP {} for {}", id, pass.name());
            pass.patch(|s| {
                s.cloud_infra_status
                    .nat_allocation_id
                    .get_or_insert_with(|| id.clone());
            })
            .await?;
            pass.status()
                .cloud_infra_status
                .nat_allocation_id
                .clone()
                .unwrap_or(id)
        }
    };

    let id = pass
        .cloud
        .network
        .create_nat_gateway(&name, &subnet_id, &allocation_id)
        .await?;
    pass.record_create("nat-gateway");
    info!(
        "Created NAT gateway {} in {} for {}",
        id,
        subnet_id,
        pass.name()
    );

    pass.patch(|s| {
        s.cloud_infra_status
            .nat_gateway_id
            .get_or_insert_with(|| id.clone());
    })
    .await?;
    Ok(pass
        .status()
        .cloud_infra_status
        .nat_gateway_id
        .clone()
        .unwrap_or(id))
}

async fn ensure_nat_routes(
    pass: &mut Pass<'_>,
    vpc_id: &str,
    public_route_table_id: &str,
    nat_id: &str,
) -> Result<()> {
    if pass.status().cloud_infra_status.nat_attached {
        return Ok(());
    }

    let updated = pass
        .cloud
        .network
        .route_private_tables_via_nat(vpc_id, public_route_table_id, nat_id)
        .await?;
    info!(
        "Routed {} private route tables through {} for {}",
        updated,
        nat_id,
        pass.name()
    );
    pass.patch(|s| s.cloud_infra_status.nat_attached = true)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::NetworkMode;
    use crate::testing::{Harness, dataplane};

    #[tokio::test]
    async fn test_full_network_on_first_pass() {
        let harness = Harness::new(vec![dataplane("demo")]);
        let step = reconcile(&mut harness.pass("demo")).await.unwrap();
        assert_eq!(step, Step::Ready);

        let infra = harness.status("demo").cloud_infra_status;
        assert!(infra.vpc.is_some());
        assert_eq!(infra.subnet_ids.len(), 4);
        assert_eq!(infra.security_group_ids.len(), 1);
        assert!(infra.internet_gateway_id.is_some());
        assert!(infra.public_route_table_id.is_some());
        assert!(infra.nat_gateway_id.is_some());
        assert!(infra.nat_attached);
        assert!(infra.inbound_rule_added);
        assert!(infra.dns_hostnames_enabled);
        assert!(infra.internet_gateway_attached);
        assert!(infra.public_route_added);
        assert_eq!(
            infra.public_subnets_configured,
            vec![infra.subnet_ids[1].clone(), infra.subnet_ids[3].clone()]
        );
        assert!(infra.nat_allocation_id.is_some());
        assert_eq!(harness.cloud.calls("create_subnet"), 4);
        assert_eq!(harness.cloud.calls("authorize_ingress"), 1);
    }

    #[tokio::test]
    async fn test_second_pass_creates_nothing() {
        let harness = Harness::new(vec![dataplane("demo")]);
        reconcile(&mut harness.pass("demo")).await.unwrap();
        let before = harness.status("demo");
        let creates = harness.cloud.total_creates();

        reconcile(&mut harness.pass("demo")).await.unwrap();
        assert_eq!(harness.cloud.total_creates(), creates);
        assert_eq!(harness.status("demo"), before);
        assert_eq!(harness.cloud.calls("create_vpc"), 1);
        assert_eq!(harness.cloud.calls("route_private_tables_via_nat"), 1);
    }

    #[tokio::test]
    async fn test_resumes_at_subnets_when_vpc_exists() {
        let mut record = dataplane("demo");
        let infra = &mut record.status.get_or_insert_with(Default::default).cloud_infra_status;
        infra.vpc = Some("vpc-existing".to_string());
        infra.vpc_cidr = Some("10.7.0.0/16".to_string());
        let harness = Harness::new(vec![record]);

        reconcile(&mut harness.pass("demo")).await.unwrap();

        let infra = harness.status("demo").cloud_infra_status;
        assert_eq!(harness.cloud.calls("create_vpc"), 0);
        assert_eq!(infra.vpc.as_deref(), Some("vpc-existing"));
        assert_eq!(infra.subnet_ids.len(), 4);
        let cidrs = harness.cloud.subnet_cidrs();
        assert_eq!(
            cidrs,
            vec!["10.7.0.0/20", "10.7.16.0/20", "10.7.32.0/20", "10.7.48.0/20"]
        );
    }

    #[tokio::test]
    async fn test_subnet_list_only_grows_and_is_capped() {
        let harness = Harness::new(vec![dataplane("demo")]);
        // Fail after two subnets were created.
        harness.cloud.fail_after("create_subnet", 2);

        assert!(reconcile(&mut harness.pass("demo")).await.is_err());
        let first = harness.status("demo").cloud_infra_status.subnet_ids;
        assert_eq!(first.len(), 2);

        harness.cloud.clear_failures();
        reconcile(&mut harness.pass("demo")).await.unwrap();
        let second = harness.status("demo").cloud_infra_status.subnet_ids;
        assert_eq!(second.len(), 4);
        assert_eq!(&second[..2], &first[..]);

        for _ in 0..3 {
            reconcile(&mut harness.pass("demo")).await.unwrap();
            let ids = harness.status("demo").cloud_infra_status.subnet_ids;
            assert_eq!(ids.len(), 4);
        }
        assert_eq!(harness.cloud.calls("create_subnet"), 4);
    }

    #[tokio::test]
    async fn test_public_subnet_setup_failure_keeps_subnet() {
        let harness = Harness::new(vec![dataplane("demo")]);
        // Subnet 1 is created, then joining it to the public route table fails.
        harness.cloud.fail_after("configure_public_subnet", 0);

        assert!(reconcile(&mut harness.pass("demo")).await.is_err());
        let infra = harness.status("demo").cloud_infra_status;
        assert_eq!(infra.subnet_ids.len(), 4);
        assert!(infra.public_subnets_configured.is_empty());

        harness.cloud.clear_failures();
        reconcile(&mut harness.pass("demo")).await.unwrap();
        let infra = harness.status("demo").cloud_infra_status;
        assert_eq!(infra.public_subnets_configured.len(), 2);
        assert_eq!(harness.cloud.calls("create_subnet"), 4);
        assert_eq!(harness.cloud.calls("configure_public_subnet"), 2);
    }

    #[tokio::test]
    async fn test_subnet_failure_between_creates_resumes_at_next_index() {
        let harness = Harness::new(vec![dataplane("demo")]);
        harness.cloud.fail_after("create_subnet", 2);

        assert!(reconcile(&mut harness.pass("demo")).await.is_err());
        harness.cloud.clear_failures();
        reconcile(&mut harness.pass("demo")).await.unwrap();

        let infra = harness.status("demo").cloud_infra_status;
        let block = Ipv4Block::parse(infra.vpc_cidr.as_deref().unwrap()).unwrap();
        let expected: Vec<String> = (0..4)
            .map(|i| block.subnet(i).unwrap().to_string())
            .collect();
        assert_eq!(harness.cloud.subnet_cidrs(), expected);
    }

    #[tokio::test]
    async fn test_gateway_attach_failure_keeps_gateway() {
        let harness = Harness::new(vec![dataplane("demo")]);
        harness.cloud.fail_after("attach_internet_gateway", 0);

        assert!(reconcile(&mut harness.pass("demo")).await.is_err());
        let infra = harness.status("demo").cloud_infra_status;
        let igw = infra.internet_gateway_id.clone().unwrap();
        assert!(!infra.internet_gateway_attached);

        harness.cloud.clear_failures();
        reconcile(&mut harness.pass("demo")).await.unwrap();
        let infra = harness.status("demo").cloud_infra_status;
        assert_eq!(infra.internet_gateway_id.as_deref(), Some(igw.as_str()));
        assert!(infra.internet_gateway_attached);
        assert_eq!(harness.cloud.calls("create_internet_gateway"), 1);
    }

    #[tokio::test]
    async fn test_nat_failure_reuses_elastic_ip() {
        let harness = Harness::new(vec![dataplane("demo")]);
        harness.cloud.fail_after("create_nat_gateway", 0);

        assert!(reconcile(&mut harness.pass("demo")).await.is_err());
        let allocation = harness.status("demo").cloud_infra_status.nat_allocation_id;
        assert!(allocation.is_some());

        harness.cloud.clear_failures();
        reconcile(&mut harness.pass("demo")).await.unwrap();
        let infra = harness.status("demo").cloud_infra_status;
        assert_eq!(infra.nat_allocation_id, allocation);
        assert!(infra.nat_gateway_id.is_some());
        assert_eq!(harness.cloud.calls("allocate_address"), 1);
        assert_eq!(harness.cloud.calls("create_vpc"), 1);
    }

    #[tokio::test]
    async fn test_odd_subnets_are_public() {
        let harness = Harness::new(vec![dataplane("demo")]);
        reconcile(&mut harness.pass("demo")).await.unwrap();
        assert_eq!(harness.cloud.public_subnets(), vec![false, true, false, true]);
    }

    #[tokio::test]
    async fn test_nat_gateway_in_first_public_subnet() {
        let harness = Harness::new(vec![dataplane("demo")]);
        reconcile(&mut harness.pass("demo")).await.unwrap();
        let infra = harness.status("demo").cloud_infra_status;
        assert_eq!(
            harness.cloud.nat_subnet().as_deref(),
            Some(infra.subnet_ids[1].as_str())
        );
    }

    #[tokio::test]
    async fn test_bring_your_own_network_is_adopted() {
        let mut record = dataplane("demo");
        record.spec.network.mode = NetworkMode::BringYourOwn;
        record.spec.network.subnet_ids = vec!["subnet-a".to_string(), "subnet-b".to_string()];
        record.spec.network.security_group_ids = vec!["sg-a".to_string()];
        let harness = Harness::new(vec![record]);

        assert_eq!(reconcile(&mut harness.pass("demo")).await.unwrap(), Step::Ready);
        let infra = harness.status("demo").cloud_infra_status;
        assert_eq!(infra.subnet_ids, vec!["subnet-a", "subnet-b"]);
        assert_eq!(infra.security_group_ids, vec!["sg-a"]);
        assert_eq!(harness.cloud.total_creates(), 0);
    }
}
