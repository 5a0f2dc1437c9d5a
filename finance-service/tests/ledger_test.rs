mod common;

use common::{at, d, TestLedger};
use finance_service::error::FinanceError;
use finance_service::models::{
    AdjustmentKind, BillingPeriod, InvoiceStatus, LedgerEntry, PaymentMethod, PaymentSource,
    PaymentStatus, Unit,
};
use finance_service::services::{LedgerEvent, LedgerStore, NewAdjustment, NewInvoice, NewPayment};
use rust_decimal::Decimal;
use uuid::Uuid;

fn invoice(tenant_id: Uuid, year: i32, month: u32, amount: &str) -> NewInvoice {
    NewInvoice {
        tenant_id,
        unit_id: None,
        period: BillingPeriod::new(year, month).unwrap(),
        amount_due: Some(d(amount)),
        due_date: None,
    }
}

fn payment(tenant_id: Uuid, amount: &str) -> NewPayment {
    NewPayment {
        tenant_id,
        unit_id: None,
        amount: d(amount),
        method: PaymentMethod::Cash,
        source: PaymentSource::Counter,
        external_tx_id: None,
        phone: None,
        paid_at: None,
        description: None,
        notes: None,
        status: PaymentStatus::Paid,
    }
}

#[tokio::test]
async fn payment_reduces_oldest_invoice_first() {
    let t = TestLedger::new();
    let tenant = t.tenant("Achieng").await;
    let i2 = t
        .ledger
        .issue_invoice(invoice(tenant.tenant_id, 2026, 3, "1000"))
        .await
        .unwrap();
    let i1 = t
        .ledger
        .issue_invoice(invoice(tenant.tenant_id, 2026, 2, "1000"))
        .await
        .unwrap();

    t.ledger
        .record_payment(payment(tenant.tenant_id, "700"))
        .await
        .unwrap();

    let book = t.store.load_book(tenant.tenant_id).await.unwrap();
    let find = |id: Uuid| book.invoices.iter().find(|i| i.invoice_id == id).unwrap();
    assert_eq!(find(i1.invoice_id).amount_paid, d("700"));
    assert_eq!(find(i1.invoice_id).status, InvoiceStatus::PartiallyPaid);
    assert_eq!(find(i2.invoice_id).amount_paid, Decimal::ZERO);
    assert_eq!(find(i2.invoice_id).status, InvoiceStatus::Open);
    assert_eq!(book.allocations.len(), 1);
}

#[tokio::test]
async fn overpayment_spills_into_next_invoice() {
    let t = TestLedger::new();
    let tenant = t.tenant("Otieno").await;
    t.ledger
        .issue_invoice(invoice(tenant.tenant_id, 2026, 2, "1000"))
        .await
        .unwrap();
    t.ledger
        .issue_invoice(invoice(tenant.tenant_id, 2026, 3, "1000"))
        .await
        .unwrap();

    t.ledger
        .record_payment(payment(tenant.tenant_id, "1500"))
        .await
        .unwrap();

    let book = t.store.load_book(tenant.tenant_id).await.unwrap();
    let mut invoices = book.invoices.clone();
    invoices.sort_by_key(|i| i.period());
    assert_eq!(invoices[0].status, InvoiceStatus::Paid);
    assert_eq!(invoices[1].amount_paid, d("500"));
}

#[tokio::test]
async fn recorded_payment_appears_once_in_history() {
    let t = TestLedger::new();
    let tenant = t.tenant("Kamau").await;
    let paid_at = at("2026-03-02T07:15:30Z");

    let recorded = t
        .ledger
        .record_payment(NewPayment {
            paid_at: Some(paid_at),
            ..payment(tenant.tenant_id, "1234.56")
        })
        .await
        .unwrap();

    let history = t
        .ledger
        .list_history(tenant.tenant_id, None, None)
        .await
        .unwrap();
    let matches: Vec<_> = history
        .iter()
        .filter_map(|l| match &l.entry {
            LedgerEntry::Payment(p) if p.payment_id == recorded.payment_id => Some(p),
            _ => None,
        })
        .collect();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].amount, d("1234.56"));
    assert_eq!(matches[0].paid_at, paid_at);
}

#[tokio::test]
async fn duplicate_external_tx_id_is_idempotent() {
    let t = TestLedger::new();
    let tenant = t.tenant("Njeri").await;
    let first = t
        .ledger
        .record_payment(NewPayment {
            external_tx_id: Some("QK12ABC".to_string()),
            ..payment(tenant.tenant_id, "5000")
        })
        .await
        .unwrap();
    let second = t
        .ledger
        .record_payment(NewPayment {
            external_tx_id: Some("QK12ABC".to_string()),
            ..payment(tenant.tenant_id, "5000")
        })
        .await
        .unwrap();

    assert_eq!(first.payment_id, second.payment_id);
    assert_eq!(t.payment_count(tenant.tenant_id).await, 1);
}

#[tokio::test]
async fn new_invoice_consumes_prepaid_credit() {
    let t = TestLedger::new();
    let tenant = t.tenant("Wafula").await;
    t.ledger
        .record_payment(payment(tenant.tenant_id, "25000"))
        .await
        .unwrap();

    let march = t
        .ledger
        .issue_invoice(invoice(tenant.tenant_id, 2026, 3, "20000"))
        .await
        .unwrap();
    assert_eq!(march.status, InvoiceStatus::Paid);
    assert_eq!(march.amount_paid, d("20000"));

    let april = t
        .ledger
        .issue_invoice(invoice(tenant.tenant_id, 2026, 4, "20000"))
        .await
        .unwrap();
    assert_eq!(april.status, InvoiceStatus::PartiallyPaid);
    assert_eq!(april.amount_paid, d("5000"));
}

#[tokio::test]
async fn one_invoice_per_period() {
    let t = TestLedger::new();
    let tenant = t.tenant("Chebet").await;
    t.ledger
        .issue_invoice(invoice(tenant.tenant_id, 2026, 3, "1000"))
        .await
        .unwrap();
    let err = t
        .ledger
        .issue_invoice(invoice(tenant.tenant_id, 2026, 3, "1000"))
        .await
        .unwrap_err();
    assert!(matches!(err, FinanceError::Conflict(_)));
}

#[tokio::test]
async fn invoice_defaults_to_unit_rent_and_fifth_of_month() {
    let t = TestLedger::new();
    let tenant = t.tenant_with_rent("Kiprop", "18500").await;

    let issued = t
        .ledger
        .issue_invoice(NewInvoice {
            amount_due: None,
            ..invoice(tenant.tenant_id, 2026, 3, "0")
        })
        .await
        .unwrap();
    assert_eq!(issued.amount_due, d("18500"));
    assert_eq!(issued.due_date.to_string(), "2026-03-05");
    assert_eq!(issued.unit_id, tenant.unit_id());

    let bare = t.tenant("Auma").await;
    let err = t
        .ledger
        .issue_invoice(NewInvoice {
            amount_due: None,
            ..invoice(bare.tenant_id, 2026, 3, "0")
        })
        .await
        .unwrap_err();
    assert!(matches!(err, FinanceError::Validation(_)));
}

#[tokio::test]
async fn assigning_unit_can_issue_current_invoice() {
    let t = TestLedger::new();
    let tenant = t.tenant("Barasa").await;
    let unit = Unit {
        unit_id: Uuid::new_v4(),
        property_id: None,
        label: Some("C3".to_string()),
        monthly_rent: d("20000"),
    };

    let (tenant, invoice) = t
        .ledger
        .assign_unit(tenant.tenant_id, unit.clone(), true)
        .await
        .unwrap();
    let invoice = invoice.expect("invoice issued");
    assert_eq!(invoice.period(), BillingPeriod::new(2026, 3).unwrap());
    assert_eq!(invoice.amount_due, d("20000"));
    assert_eq!(tenant.unit, Some(unit.clone()));

    // Reassigning within the same period returns the existing invoice.
    let (_, again) = t
        .ledger
        .assign_unit(tenant.tenant_id, unit, true)
        .await
        .unwrap();
    assert_eq!(again.unwrap().invoice_id, invoice.invoice_id);

    let active = t
        .ledger
        .get_active_invoice(tenant.tenant_id)
        .await
        .unwrap();
    assert_eq!(active.map(|i| i.invoice_id), Some(invoice.invoice_id));
}

#[tokio::test]
async fn pending_payment_settles_once() {
    let t = TestLedger::new();
    let tenant = t.tenant("Omondi").await;
    t.ledger
        .issue_invoice(invoice(tenant.tenant_id, 2026, 3, "1000"))
        .await
        .unwrap();

    let pending = t
        .ledger
        .record_payment(NewPayment {
            status: PaymentStatus::Pending,
            ..payment(tenant.tenant_id, "1000")
        })
        .await
        .unwrap();
    let book = t.store.load_book(tenant.tenant_id).await.unwrap();
    assert!(book.allocations.is_empty());

    let settled = t
        .ledger
        .settle_payment(pending.payment_id, PaymentStatus::Paid, Some("Confirmed by bank".into()))
        .await
        .unwrap();
    assert_eq!(settled.status, PaymentStatus::Paid);
    assert_eq!(settled.notes.as_deref(), Some("Confirmed by bank"));

    let book = t.store.load_book(tenant.tenant_id).await.unwrap();
    assert_eq!(book.invoices[0].status, InvoiceStatus::Paid);

    let err = t
        .ledger
        .settle_payment(pending.payment_id, PaymentStatus::Failed, None)
        .await
        .unwrap_err();
    assert!(matches!(err, FinanceError::Conflict(_)));

    let err = t
        .ledger
        .settle_payment(Uuid::new_v4(), PaymentStatus::Paid, None)
        .await
        .unwrap_err();
    assert!(matches!(err, FinanceError::PaymentNotFound(_)));
}

#[tokio::test]
async fn invalid_writes_are_rejected() {
    let t = TestLedger::new();
    let tenant = t.tenant("Mwangi").await;

    for amount in ["0", "-10", "0.001"] {
        let err = t
            .ledger
            .record_payment(payment(tenant.tenant_id, amount))
            .await
            .unwrap_err();
        assert!(matches!(err, FinanceError::Validation(_)), "amount {}", amount);
    }

    let err = t
        .ledger
        .record_payment(payment(Uuid::nil(), "100"))
        .await
        .unwrap_err();
    assert!(matches!(err, FinanceError::Validation(_)));

    let err = t
        .ledger
        .record_adjustment(NewAdjustment {
            tenant_id: Uuid::new_v4(),
            unit_id: None,
            amount: d("100"),
            kind: AdjustmentKind::Debit,
            reason: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, FinanceError::TenantNotFound(_)));
    assert_eq!(t.payment_count(tenant.tenant_id).await, 0);
}

#[tokio::test]
async fn history_is_limited_and_filtered_by_unit() {
    let t = TestLedger::new();
    let tenant = t.tenant_with_rent("Kibet", "10000").await;
    let unit_id = tenant.unit_id();

    for _ in 0..3 {
        t.ledger
            .record_payment(NewPayment {
                unit_id,
                ..payment(tenant.tenant_id, "100")
            })
            .await
            .unwrap();
        t.clock.advance(chrono::Duration::hours(1));
    }
    t.ledger
        .record_adjustment(NewAdjustment {
            tenant_id: tenant.tenant_id,
            unit_id: None,
            amount: d("50"),
            kind: AdjustmentKind::Debit,
            reason: Some("Water".to_string()),
        })
        .await
        .unwrap();

    let all = t
        .ledger
        .list_history(tenant.tenant_id, None, None)
        .await
        .unwrap();
    assert_eq!(all.len(), 4);
    assert!(matches!(all[0].entry, LedgerEntry::Adjustment(_)));
    assert_eq!(all[0].running_balance, d("-250"));

    let limited = t
        .ledger
        .list_history(tenant.tenant_id, None, Some(2))
        .await
        .unwrap();
    assert_eq!(limited.len(), 2);

    let unit_only = t
        .ledger
        .list_history(tenant.tenant_id, unit_id, None)
        .await
        .unwrap();
    assert_eq!(unit_only.len(), 3);
    assert_eq!(unit_only[0].running_balance, d("-300"));
}

#[tokio::test]
async fn writes_publish_events() {
    let t = TestLedger::new();
    let mut events = t.ledger.subscribe();
    let tenant = t.tenant("Auma").await;

    let recorded = t
        .ledger
        .record_payment(payment(tenant.tenant_id, "100"))
        .await
        .unwrap();

    assert_eq!(
        events.recv().await.unwrap(),
        LedgerEvent::TenantChanged {
            tenant_id: tenant.tenant_id
        }
    );
    assert_eq!(
        events.recv().await.unwrap(),
        LedgerEvent::PaymentRecorded {
            tenant_id: tenant.tenant_id,
            payment_id: recorded.payment_id
        }
    );
}
