//! Package selection and the carrier collaborator.
pub mod carrier;
pub mod weight;

pub use carrier::{
    build_shipment_request, describe_items, sanitize_order_ref, sanitize_phone, CarrierClient,
    CarrierError, CarrierShipment, Consignee, HttpCarrierClient, PaymentMode, ShipmentLine,
    ShipmentRequest, TrackingInfo, TrackingQuery,
};
pub use weight::{select_package, Dimensions, PackageSelection, PackageTier};
