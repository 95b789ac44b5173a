//! Pre-dispatch checks

use crate::error::ValidationError;
use disbursement_core::payment::{ledger_amount, NATIVE_ASSET_CODE};
use disbursement_core::{
    DisbursementStatus, Payment, PaymentBatch, PaymentStatus, ReceiverWalletStatus,
};

/// Check that `payment` can be sent, using the wallet and disbursement loaded with it
pub fn validate_payment_ready_for_sending(
    payment: &Payment,
    batch: &PaymentBatch,
) -> Result<(), ValidationError> {
    if payment.status != PaymentStatus::Ready {
        return Err(ValidationError::PaymentNotReady {
            payment_id: payment.id.clone(),
            expected: PaymentStatus::Ready,
        });
    }

    let wallet = batch
        .receiver_wallet(payment)
        .ok_or_else(|| ValidationError::ReceiverWalletMissing {
            wallet_id: payment.receiver_wallet_id.clone(),
            payment_id: payment.id.clone(),
        })?;
    if wallet.status != ReceiverWalletStatus::Registered {
        return Err(ValidationError::ReceiverWalletNotRegistered {
            wallet_id: wallet.id.clone(),
            payment_id: payment.id.clone(),
        });
    }

    let disbursement =
        batch
            .disbursement(payment)
            .ok_or_else(|| ValidationError::DisbursementMissing {
                disbursement_id: payment.disbursement_id.clone(),
                payment_id: payment.id.clone(),
            })?;
    if disbursement.status != DisbursementStatus::Started {
        return Err(ValidationError::DisbursementNotStarted {
            disbursement_id: disbursement.id.clone(),
            payment_id: payment.id.clone(),
        });
    }

    if payment.id.is_empty() {
        return Err(ValidationError::EmptyPaymentId);
    }
    if payment.asset.code.is_empty() {
        return Err(ValidationError::EmptyAssetCode(payment.id.clone()));
    }
    if payment.asset.issuer.is_empty() && !payment.asset.code.eq_ignore_ascii_case(NATIVE_ASSET_CODE) {
        return Err(ValidationError::EmptyAssetIssuer(payment.id.clone()));
    }
    if ledger_amount(&payment.amount).is_none() {
        return Err(ValidationError::InvalidAmount(payment.id.clone()));
    }
    if wallet.stellar_address.is_empty() {
        return Err(ValidationError::EmptyDestination(payment.id.clone()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use disbursement_core::{Asset, Disbursement, ReceiverWallet};

    fn batch_with(payment: Payment, wallet: ReceiverWallet, status: DisbursementStatus) -> PaymentBatch {
        let mut batch = PaymentBatch::new();
        let disbursement = Disbursement {
            id: payment.disbursement_id.clone(),
            name: "April stipends".to_string(),
            status,
        };
        batch.push(payment, wallet, disbursement);
        batch
    }

    fn usdc() -> Asset {
        Asset::new("USDC", "GISSUER")
    }

    fn check(batch: &PaymentBatch) -> Result<(), ValidationError> {
        validate_payment_ready_for_sending(&batch.payments()[0], batch)
    }

    #[test]
    fn test_valid_payment() {
        let batch = batch_with(
            Payment::new("p1", "10.5", usdc(), "rw1", "d1"),
            ReceiverWallet::registered("rw1", "r1", "GRECEIVER"),
            DisbursementStatus::Started,
        );
        assert_eq!(check(&batch), Ok(()));
    }

    #[test]
    fn test_status_checks() {
        let mut payment = Payment::new("p1", "10", usdc(), "rw1", "d1");
        payment.transition(PaymentStatus::Pending, "");
        let batch = batch_with(
            payment,
            ReceiverWallet::registered("rw1", "r1", "GRECEIVER"),
            DisbursementStatus::Started,
        );
        assert_eq!(
            check(&batch).unwrap_err().to_string(),
            "payment p1 is not in READY state"
        );

        let mut wallet = ReceiverWallet::registered("rw1", "r1", "GRECEIVER");
        wallet.status = ReceiverWalletStatus::Ready;
        let batch = batch_with(
            Payment::new("p1", "10", usdc(), "rw1", "d1"),
            wallet,
            DisbursementStatus::Started,
        );
        assert_eq!(
            check(&batch).unwrap_err().to_string(),
            "receiver wallet rw1 for payment p1 is not in REGISTERED state"
        );

        let batch = batch_with(
            Payment::new("p1", "10", usdc(), "rw1", "d1"),
            ReceiverWallet::registered("rw1", "r1", "GRECEIVER"),
            DisbursementStatus::Paused,
        );
        assert_eq!(
            check(&batch).unwrap_err().to_string(),
            "disbursement d1 for payment p1 is not in STARTED state"
        );
    }

    #[test]
    fn test_field_checks() {
        let wallet = || ReceiverWallet::registered("rw1", "r1", "GRECEIVER");

        let batch = batch_with(
            Payment::new("p1", "10", Asset::new("", "GISSUER"), "rw1", "d1"),
            wallet(),
            DisbursementStatus::Started,
        );
        assert_eq!(check(&batch), Err(ValidationError::EmptyAssetCode("p1".to_string())));

        let batch = batch_with(
            Payment::new("p1", "10", Asset::new("USDC", ""), "rw1", "d1"),
            wallet(),
            DisbursementStatus::Started,
        );
        assert_eq!(check(&batch), Err(ValidationError::EmptyAssetIssuer("p1".to_string())));

        let batch = batch_with(
            Payment::new("p1", "10", Asset::new("XLM", ""), "rw1", "d1"),
            wallet(),
            DisbursementStatus::Started,
        );
        assert_eq!(check(&batch), Ok(()));

        let batch = batch_with(
            Payment::new("p1", "0", usdc(), "rw1", "d1"),
            wallet(),
            DisbursementStatus::Started,
        );
        assert_eq!(
            check(&batch).unwrap_err().to_string(),
            "payment amount is invalid for payment p1"
        );

        let batch = batch_with(
            Payment::new("p1", "10", usdc(), "rw1", "d1"),
            ReceiverWallet::registered("rw1", "r1", ""),
            DisbursementStatus::Started,
        );
        assert_eq!(check(&batch), Err(ValidationError::EmptyDestination("p1".to_string())));
    }

    #[test]
    fn test_missing_references() {
        let mut batch = batch_with(
            Payment::new("p1", "10", usdc(), "rw1", "d1"),
            ReceiverWallet::registered("rw1", "r1", "GRECEIVER"),
            DisbursementStatus::Started,
        );
        batch.push(
            Payment::new("p2", "10", usdc(), "rw-other", "d1"),
            ReceiverWallet::registered("rw1", "r1", "GRECEIVER"),
            Disbursement {
                id: "d1".to_string(),
                name: "April stipends".to_string(),
                status: DisbursementStatus::Started,
            },
        );
        let result = validate_payment_ready_for_sending(&batch.payments()[1], &batch);
        assert!(matches!(result, Err(ValidationError::ReceiverWalletMissing { .. })));
    }
}
