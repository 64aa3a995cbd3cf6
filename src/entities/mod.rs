pub mod allocation;
pub mod channel;
pub mod channel_warehouse;
pub mod checkout;
pub mod checkout_line;
pub mod fulfillment;
pub mod fulfillment_line;
pub mod gift_card;
pub mod invoice;
pub mod order;
pub mod order_discount;
pub mod order_event;
pub mod order_line;
pub mod payment;
pub mod payment_transaction;
pub mod preorder_allocation;
pub mod product_variant;
pub mod shipping_method;
pub mod stock;
pub mod variant_channel_listing;
pub mod voucher;
pub mod warehouse;
