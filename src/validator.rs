//! Static validation of role chains. Nothing here touches the network.

pub const DEFAULT_MAX_STEPS: usize = 5;

const PARTITIONS: &[&str] = &["aws", "aws-cn", "aws-us-gov"];

/// An account-scoped IAM role ARN: `arn:<partition>:iam::<account>:role/<path/>name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleArn<'a> {
    pub partition: &'a str,
    pub account_id: &'a str,
    /// Role name including any path, e.g. `service-role/MyRole`.
    pub role_name: &'a str,
}

impl<'a> RoleArn<'a> {
    pub fn parse(arn: &'a str) -> Option<Self> {
        let parts: Vec<&str> = arn.splitn(6, ':').collect();
        let &[prefix, partition, service, region, account_id, resource] = parts.as_slice() else {
            return None;
        };
        if prefix != "arn" || service != "iam" || !region.is_empty() {
            return None;
        }
        if !PARTITIONS.contains(&partition) || !is_account_id(account_id) {
            return None;
        }
        let role_name = resource.strip_prefix("role/")?;
        if role_name.is_empty() || role_name.ends_with('/') || !role_name.chars().all(is_role_char)
        {
            return None;
        }
        Some(Self {
            partition,
            account_id,
            role_name,
        })
    }
}

fn is_account_id(s: &str) -> bool {
    s.len() == 12 && s.bytes().all(|b| b.is_ascii_digit())
}

fn is_role_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '+' | '=' | ',' | '.' | '@' | '_' | '-' | '/')
}

/// Extracts the account id from any ARN (`arn:partition:service:region:account:...`).
pub fn account_from_arn(arn: &str) -> Option<&str> {
    arn.split(':').nth(4).filter(|s| !s.is_empty())
}

/// Validates a chain against `max_steps`, returning the first problem found.
pub fn validate_chain(chain: &[crate::credentials::RoleChainStep], max_steps: usize) -> crate::Result<()> {
    if chain.is_empty() {
        return Err(crate::Error::EmptyChain);
    }
    if chain.len() > max_steps {
        return Err(crate::Error::ChainTooLong {
            len: chain.len(),
            max: max_steps,
        });
    }

    let mut seen = std::collections::HashSet::with_capacity(chain.len());
    for (i, step) in chain.iter().enumerate() {
        let n = i + 1;
        if RoleArn::parse(&step.role_arn).is_none() {
            return Err(crate::Error::InvalidArn {
                step: n,
                arn: step.role_arn.clone(),
            });
        }
        if !seen.insert(step.role_arn.as_str()) {
            return Err(crate::Error::CircularDependency {
                step: n,
                arn: step.role_arn.clone(),
            });
        }
        let external_ids = [
            step.external_id.as_deref(),
            step.options.as_ref().and_then(|o| o.external_id.as_deref()),
        ];
        for external_id in external_ids.into_iter().flatten() {
            if external_id.chars().count() < 2 {
                return Err(crate::Error::ExternalIdTooShort { step: n });
            }
        }
    }

    tracing::trace!(steps = chain.len(), "role chain validated");
    Ok(())
}
