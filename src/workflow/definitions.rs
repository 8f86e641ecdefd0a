/// Built-in steps tables, one per workflow kind
///
/// Adding a new process kind means adding a table here and registering its
/// handlers; the router itself never changes. Step kind names are exported so
/// handler registrations and tests refer to the same strings as the tables.

use crate::{
    error::Result,
    workflow::{
        registry::{StepTransition, StepsConfig},
        types::{WorkflowKind, INIT, MARK_FAILURE, MARK_SUCCESS},
    },
};

/// Every built-in table, compiled
pub fn all() -> Result<Vec<StepsConfig>> {
    Ok(vec![
        token_deploy::table()?,
        stake_and_mint::table()?,
        grant::table()?,
        state_root_sync::table()?,
        recovery_action::table()?,
        test::table()?,
    ])
}

/// Economy setup: token organization, branded tokens and gateway on both chains
pub mod token_deploy {
    use super::*;

    pub const GENERATE_TOKEN_ADDRESSES: &str = "generateTokenAddresses";
    pub const DEPLOY_ORIGIN_TOKEN_ORGANIZATION: &str = "deployOriginTokenOrganization";
    pub const SAVE_ORIGIN_TOKEN_ORGANIZATION: &str = "saveOriginTokenOrganization";
    pub const DEPLOY_AUX_TOKEN_ORGANIZATION: &str = "deployAuxTokenOrganization";
    pub const SAVE_AUX_TOKEN_ORGANIZATION: &str = "saveAuxTokenOrganization";
    pub const DEPLOY_ORIGIN_BRANDED_TOKEN: &str = "deployOriginBrandedToken";
    pub const SAVE_ORIGIN_BRANDED_TOKEN: &str = "saveOriginBrandedToken";
    pub const DEPLOY_UTILITY_BRANDED_TOKEN: &str = "deployUtilityBrandedToken";
    pub const SAVE_UTILITY_BRANDED_TOKEN: &str = "saveUtilityBrandedToken";
    pub const DEPLOY_GATEWAY: &str = "deployGateway";
    pub const DEPLOY_CO_GATEWAY: &str = "deployCoGateway";
    pub const ACTIVATE_GATEWAY: &str = "activateGateway";
    pub const VERIFY_ECONOMY_SETUP: &str = "verifyEconomySetup";

    pub fn table() -> Result<StepsConfig> {
        // Deploy steps submit a transaction, save steps persist its receipt
        let chain = [
            GENERATE_TOKEN_ADDRESSES,
            DEPLOY_ORIGIN_TOKEN_ORGANIZATION,
            SAVE_ORIGIN_TOKEN_ORGANIZATION,
            DEPLOY_AUX_TOKEN_ORGANIZATION,
            SAVE_AUX_TOKEN_ORGANIZATION,
            DEPLOY_ORIGIN_BRANDED_TOKEN,
            SAVE_ORIGIN_BRANDED_TOKEN,
            DEPLOY_UTILITY_BRANDED_TOKEN,
            SAVE_UTILITY_BRANDED_TOKEN,
            DEPLOY_GATEWAY,
            DEPLOY_CO_GATEWAY,
            ACTIVATE_GATEWAY,
            VERIFY_ECONOMY_SETUP,
        ];

        let mut builder = StepsConfig::builder(WorkflowKind::TokenDeploy)
            .step(INIT, StepTransition::new().on_success([GENERATE_TOKEN_ADDRESSES]));

        for (position, step_kind) in chain.iter().enumerate() {
            let next = chain.get(position + 1).copied().unwrap_or(MARK_SUCCESS);
            let mut transition = StepTransition::new().on_success([next]).on_failure(MARK_FAILURE);
            if step_kind.starts_with("save") || *step_kind == DEPLOY_CO_GATEWAY {
                transition = transition.read_data_from([chain[position - 1]]);
            }
            builder = builder.step(*step_kind, transition);
        }

        builder.compile()
    }
}

/// Stake on origin, prove on auxiliary, then progress stake and mint in parallel
pub mod stake_and_mint {
    use super::*;

    pub const APPROVE_GATEWAY_COMPOSER: &str = "approveGatewayComposerTrx";
    pub const CHECK_APPROVE_STATUS: &str = "checkApproveGatewayComposerStatus";
    pub const STAKER_REQUEST_STAKE: &str = "stakerRequestStakeTrx";
    pub const CHECK_REQUEST_STAKE_STATUS: &str = "checkRequestStakeTrxStatus";
    pub const ACCEPT_STAKE: &str = "acceptStake";
    pub const CHECK_STAKE_STATUS: &str = "checkStakeStatus";
    pub const COMMIT_STATE_ROOT: &str = "commitStateRoot";
    pub const PROVE_GATEWAY_ON_CO_GATEWAY: &str = "proveGatewayOnCoGateway";
    pub const CONFIRM_STAKE_INTENT: &str = "confirmStakeIntent";
    pub const PROGRESS_STAKE: &str = "progressStake";
    pub const CHECK_PROGRESS_STAKE_STATUS: &str = "checkProgressStakeStatus";
    pub const PROGRESS_MINT: &str = "progressMint";
    pub const CHECK_PROGRESS_MINT_STATUS: &str = "checkProgressMintStatus";

    pub fn table() -> Result<StepsConfig> {
        StepsConfig::builder(WorkflowKind::StakeAndMint)
            .step(INIT, StepTransition::new().on_success([APPROVE_GATEWAY_COMPOSER]))
            .step(
                APPROVE_GATEWAY_COMPOSER,
                StepTransition::new()
                    .on_success([CHECK_APPROVE_STATUS])
                    .on_failure(MARK_FAILURE),
            )
            .step(
                CHECK_APPROVE_STATUS,
                StepTransition::new()
                    .on_success([STAKER_REQUEST_STAKE])
                    .on_failure(MARK_FAILURE)
                    .read_data_from([APPROVE_GATEWAY_COMPOSER]),
            )
            .step(
                STAKER_REQUEST_STAKE,
                StepTransition::new()
                    .on_success([CHECK_REQUEST_STAKE_STATUS])
                    .on_failure(MARK_FAILURE),
            )
            .step(
                CHECK_REQUEST_STAKE_STATUS,
                StepTransition::new()
                    .on_success([ACCEPT_STAKE])
                    .on_failure(MARK_FAILURE)
                    .read_data_from([STAKER_REQUEST_STAKE]),
            )
            .step(
                ACCEPT_STAKE,
                StepTransition::new()
                    .on_success([CHECK_STAKE_STATUS])
                    .on_failure(MARK_FAILURE)
                    .read_data_from([CHECK_REQUEST_STAKE_STATUS]),
            )
            .step(
                CHECK_STAKE_STATUS,
                StepTransition::new()
                    .on_success([COMMIT_STATE_ROOT])
                    .on_failure(MARK_FAILURE)
                    .read_data_from([ACCEPT_STAKE]),
            )
            .step(
                COMMIT_STATE_ROOT,
                StepTransition::new()
                    .on_success([PROVE_GATEWAY_ON_CO_GATEWAY])
                    .on_failure(MARK_FAILURE),
            )
            .step(
                PROVE_GATEWAY_ON_CO_GATEWAY,
                StepTransition::new()
                    .on_success([CONFIRM_STAKE_INTENT])
                    .on_failure(MARK_FAILURE)
                    .read_data_from([COMMIT_STATE_ROOT]),
            )
            .step(
                CONFIRM_STAKE_INTENT,
                StepTransition::new()
                    .on_success([PROGRESS_STAKE, PROGRESS_MINT])
                    .on_failure(MARK_FAILURE)
                    .read_data_from([ACCEPT_STAKE, PROVE_GATEWAY_ON_CO_GATEWAY]),
            )
            .step(
                PROGRESS_STAKE,
                StepTransition::new()
                    .on_success([CHECK_PROGRESS_STAKE_STATUS])
                    .on_failure(MARK_FAILURE)
                    .read_data_from([ACCEPT_STAKE]),
            )
            .step(
                CHECK_PROGRESS_STAKE_STATUS,
                StepTransition::new()
                    .on_success([MARK_SUCCESS])
                    .on_failure(MARK_FAILURE)
                    .read_data_from([PROGRESS_STAKE]),
            )
            .step(
                PROGRESS_MINT,
                StepTransition::new()
                    .on_success([CHECK_PROGRESS_MINT_STATUS])
                    .on_failure(MARK_FAILURE)
                    .read_data_from([CONFIRM_STAKE_INTENT]),
            )
            .step(
                CHECK_PROGRESS_MINT_STATUS,
                StepTransition::new()
                    .on_success([MARK_SUCCESS])
                    .on_failure(MARK_FAILURE)
                    .read_data_from([PROGRESS_MINT]),
            )
            .compile()
    }
}

/// Sandbox funding: base currency first, then OST
pub mod grant {
    use super::*;

    pub const CHECK_GRANT_ELIGIBILITY: &str = "checkGrantEligibility";
    pub const GRANT_ETH: &str = "grantEth";
    pub const VERIFY_GRANT_ETH: &str = "verifyGrantEthTransaction";
    pub const GRANT_OST: &str = "grantOst";
    pub const VERIFY_GRANT_OST: &str = "verifyGrantOstTransaction";

    pub fn table() -> Result<StepsConfig> {
        StepsConfig::builder(WorkflowKind::Grant)
            .step(INIT, StepTransition::new().on_success([CHECK_GRANT_ELIGIBILITY]))
            .step(
                CHECK_GRANT_ELIGIBILITY,
                StepTransition::new().on_success([GRANT_ETH]).on_failure(MARK_FAILURE),
            )
            .step(
                GRANT_ETH,
                StepTransition::new().on_success([VERIFY_GRANT_ETH]).on_failure(MARK_FAILURE),
            )
            .step(
                VERIFY_GRANT_ETH,
                StepTransition::new()
                    .on_success([GRANT_OST])
                    .on_failure(MARK_FAILURE)
                    .read_data_from([GRANT_ETH]),
            )
            .step(
                GRANT_OST,
                StepTransition::new().on_success([VERIFY_GRANT_OST]).on_failure(MARK_FAILURE),
            )
            .step(
                VERIFY_GRANT_OST,
                StepTransition::new()
                    .on_success([MARK_SUCCESS])
                    .on_failure(MARK_FAILURE)
                    .read_data_from([GRANT_OST]),
            )
            .compile()
    }
}

/// Commit the origin chain's latest state root onto an auxiliary chain
pub mod state_root_sync {
    use super::*;

    pub const COMMIT_STATE_ROOT: &str = "commitStateRoot";
    pub const UPDATE_COMMITTED_STATE_ROOT_INFO: &str = "updateCommittedStateRootInfo";

    pub fn table() -> Result<StepsConfig> {
        StepsConfig::builder(WorkflowKind::StateRootSync)
            .step(INIT, StepTransition::new().on_success([COMMIT_STATE_ROOT]))
            .step(
                COMMIT_STATE_ROOT,
                StepTransition::new()
                    .on_success([UPDATE_COMMITTED_STATE_ROOT_INFO])
                    .on_failure(MARK_FAILURE),
            )
            .step(
                UPDATE_COMMITTED_STATE_ROOT_INFO,
                StepTransition::new()
                    .on_success([MARK_SUCCESS])
                    .on_failure(MARK_FAILURE)
                    .read_data_from([COMMIT_STATE_ROOT]),
            )
            .compile()
    }
}

/// Device recovery: submit, wait for the receipt, record; roll back on failure
pub mod recovery_action {
    use super::*;

    pub const INITIATE_RECOVERY: &str = "initiateRecoveryTransaction";
    pub const WAIT_FOR_RECOVERY: &str = "waitForRecoveryTransaction";
    pub const UPDATE_RECOVERY_STATUS: &str = "updateRecoveryStatus";
    pub const ROLLBACK_RECOVERY: &str = "rollbackRecoveryAction";

    pub fn table() -> Result<StepsConfig> {
        StepsConfig::builder(WorkflowKind::RecoveryAction)
            .step(INIT, StepTransition::new().on_success([INITIATE_RECOVERY]))
            .step(
                INITIATE_RECOVERY,
                StepTransition::new()
                    .on_success([WAIT_FOR_RECOVERY])
                    .on_failure(ROLLBACK_RECOVERY),
            )
            .step(
                WAIT_FOR_RECOVERY,
                StepTransition::new()
                    .on_success([UPDATE_RECOVERY_STATUS])
                    .on_failure(ROLLBACK_RECOVERY)
                    .read_data_from([INITIATE_RECOVERY]),
            )
            .step(
                UPDATE_RECOVERY_STATUS,
                StepTransition::new()
                    .on_success([MARK_SUCCESS])
                    .on_failure(ROLLBACK_RECOVERY)
                    .read_data_from([WAIT_FOR_RECOVERY]),
            )
            .step(
                ROLLBACK_RECOVERY,
                StepTransition::new()
                    .on_success([MARK_FAILURE])
                    .on_failure(MARK_FAILURE),
            )
            .compile()
    }
}

/// Engine test harness: init → s1 → s2 → markSuccess
pub mod test {
    use super::*;

    pub const S1: &str = "s1";
    pub const S2: &str = "s2";

    pub fn table() -> Result<StepsConfig> {
        StepsConfig::builder(WorkflowKind::Test)
            .step(INIT, StepTransition::new().on_success([S1]))
            .step(S1, StepTransition::new().on_success([S2]).on_failure(MARK_FAILURE))
            .step(
                S2,
                StepTransition::new().on_success([MARK_SUCCESS]).read_data_from([S1]),
            )
            .compile()
    }
}
