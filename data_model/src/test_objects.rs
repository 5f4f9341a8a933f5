pub mod tests {
    use crate::{
        InterruptionNotice,
        NoticeKind,
        PoolId,
        ProtectedInstance,
        ProtectedInstanceBuilder,
        ProviderInstanceId,
    };

    pub const TEST_ACCOUNT: &str = "acct-1";
    pub const TEST_REGION: &str = "region-1";
    pub const TEST_INSTANCE_TYPE: &str = "c5.xlarge";

    pub fn mock_primary(provider_id: &str, zone: &str) -> ProtectedInstance {
        mock_primary_at(provider_id, zone, 0)
    }

    pub fn mock_primary_at(provider_id: &str, zone: &str, created_at: u64) -> ProtectedInstance {
        ProtectedInstanceBuilder::default()
            .instance_id(ProviderInstanceId::from(provider_id))
            .account_id(TEST_ACCOUNT)
            .instance_type(TEST_INSTANCE_TYPE)
            .region(TEST_REGION)
            .pool(PoolId::from_instance_type(TEST_INSTANCE_TYPE, zone).unwrap())
            .created_at(created_at)
            .build()
            .unwrap()
    }

    pub fn mock_notice(
        provider_id: &str,
        kind: NoticeKind,
        zone: &str,
        timestamp: u64,
    ) -> InterruptionNotice {
        InterruptionNotice {
            instance_id: ProviderInstanceId::from(provider_id),
            kind,
            instance_type: TEST_INSTANCE_TYPE.to_string(),
            availability_zone: zone.to_string(),
            account_id: TEST_ACCOUNT.to_string(),
            timestamp,
        }
    }
}
